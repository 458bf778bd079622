// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the kiosk agent.
//!
//! [`AgentRuntime`] wires the local store, sync orchestrator, disk monitor and
//! shutdown coordinator together, runs startup recovery and spawns the
//! background workers. A kiosk UI embeds it and records captures through
//! [`AgentRuntime::capture`].
//!
//! # Example
//!
//! ```rust,ignore
//! use attendsync_agent::config::Config;
//! use attendsync_agent::runtime::AgentRuntime;
//! use attendsync_core::{AttendanceStatus, NewRecord};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!
//!     let runtime = AgentRuntime::builder()
//!         .with_config(&config)?
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let receipt = runtime
//!         .capture(NewRecord::attendance("2021001", AttendanceStatus::Present), None)
//!         .await?;
//!     println!("saved record {}", receipt.record_id);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Teardown order
//!
//! | Priority | Component | Action |
//! |----------|-----------|--------|
//! | 30 | `connectivity_probe`, `disk_cleanup_worker`, `queue_drain_worker` | stop and join |
//! | 20 | `sync_flush` | one bounded `process_queue` pass |
//! | 0 | `database` | close both pools |
//!
//! Capture admission closes as soon as draining starts, before any teardown
//! runs.

use std::path::PathBuf;
use std::sync::Arc;

use attendsync_core::capture::{Artifact, CaptureConfig, CaptureReceipt, CaptureService};
use attendsync_core::shutdown::{self, ShutdownConfig, ShutdownCoordinator, ShutdownMarker, ShutdownPhase};
use attendsync_core::sync::{BatchReport, SyncConfig, SyncStatus};
use attendsync_core::{
    ConnectivityState, Database, DiskConfig, DiskMonitor, DiskStatus, HttpBackend, LocalStore,
    NewRecord, RemoteBackend, SyncOrchestrator,
};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use crate::config::Config;
use crate::connectivity_probe::{ConnectivityProbe, ConnectivityProbeConfig};
use crate::disk_cleanup_worker::{DiskCleanupWorker, DiskCleanupWorkerConfig};
use crate::error::{Error, Result};
use crate::queue_drain_worker::{QueueDrainWorker, QueueDrainWorkerConfig};

const PRIORITY_WORKERS: i32 = 30;
const PRIORITY_SYNC_FLUSH: i32 = 20;
const PRIORITY_DATABASE: i32 = 0;

/// Builder for creating an [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    database: Option<Database>,
    database_path: PathBuf,
    reader_connections: u32,
    backend: Option<Arc<dyn RemoteBackend>>,
    device_id: String,
    sync_config: SyncConfig,
    disk_config: DiskConfig,
    capture_config: CaptureConfig,
    shutdown_config: ShutdownConfig,
    queue_drain_config: QueueDrainWorkerConfig,
    disk_cleanup_config: DiskCleanupWorkerConfig,
    probe_config: ConnectivityProbeConfig,
    handle_signals: bool,
}

impl Default for AgentRuntimeBuilder {
    fn default() -> Self {
        Self {
            database: None,
            database_path: PathBuf::from(".data/attendance.db"),
            reader_connections: 4,
            backend: None,
            device_id: "kiosk-01".to_string(),
            sync_config: SyncConfig::default(),
            disk_config: DiskConfig::default(),
            capture_config: CaptureConfig::default(),
            shutdown_config: ShutdownConfig::default(),
            queue_drain_config: QueueDrainWorkerConfig::default(),
            disk_cleanup_config: DiskCleanupWorkerConfig::default(),
            probe_config: ConnectivityProbeConfig::default(),
            handle_signals: true,
        }
    }
}

impl AgentRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every setting from a loaded [`Config`] and create the HTTP
    /// backend it describes.
    pub fn with_config(mut self, config: &Config) -> Result<Self> {
        self.database_path = config.database_path.clone();
        self.device_id = config.device_id.clone();
        self.sync_config = config.sync_config();
        self.disk_config = config.disk_config();
        self.capture_config = config.capture_config();
        self.shutdown_config = config.shutdown_config();
        self.queue_drain_config = config.queue_drain_config();
        self.disk_cleanup_config = config.disk_cleanup_config();
        self.probe_config = config.probe_config();
        self.backend = Some(Arc::new(HttpBackend::new(config.backend_config())?));
        Ok(self)
    }

    /// Use an already opened database instead of opening `database_path`.
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Set the SQLite file to open.
    ///
    /// Default: `.data/attendance.db`
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Set the remote backend (required).
    pub fn backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the device identifier stamped on captures.
    ///
    /// Default: `kiosk-01`
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Set the orchestrator configuration.
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    /// Set the disk monitor configuration.
    pub fn disk_config(mut self, config: DiskConfig) -> Self {
        self.disk_config = config;
        self
    }

    /// Set the capture configuration.
    pub fn capture_config(mut self, config: CaptureConfig) -> Self {
        self.capture_config = config;
        self
    }

    /// Set the shutdown coordinator configuration.
    pub fn shutdown_config(mut self, config: ShutdownConfig) -> Self {
        self.shutdown_config = config;
        self
    }

    /// Set the queue-drain worker configuration.
    pub fn queue_drain_config(mut self, config: QueueDrainWorkerConfig) -> Self {
        self.queue_drain_config = config;
        self
    }

    /// Set the disk-cleanup worker configuration.
    pub fn disk_cleanup_config(mut self, config: DiskCleanupWorkerConfig) -> Self {
        self.disk_cleanup_config = config;
        self
    }

    /// Set the connectivity probe configuration.
    pub fn probe_config(mut self, config: ConnectivityProbeConfig) -> Self {
        self.probe_config = config;
        self
    }

    /// Whether to install SIGTERM/SIGINT handlers that trigger shutdown.
    ///
    /// Default: `true`
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<AgentRuntimeConfig> {
        let backend = self.backend.ok_or(Error::MissingComponent("backend"))?;

        Ok(AgentRuntimeConfig {
            database: self.database,
            database_path: self.database_path,
            reader_connections: self.reader_connections,
            backend,
            device_id: self.device_id,
            sync_config: self.sync_config,
            disk_config: self.disk_config,
            capture_config: self.capture_config,
            shutdown_config: self.shutdown_config,
            queue_drain_config: self.queue_drain_config,
            disk_cleanup_config: self.disk_cleanup_config,
            probe_config: self.probe_config,
            handle_signals: self.handle_signals,
        })
    }
}

/// Configuration for an [`AgentRuntime`].
pub struct AgentRuntimeConfig {
    database: Option<Database>,
    database_path: PathBuf,
    reader_connections: u32,
    backend: Arc<dyn RemoteBackend>,
    device_id: String,
    sync_config: SyncConfig,
    disk_config: DiskConfig,
    capture_config: CaptureConfig,
    shutdown_config: ShutdownConfig,
    queue_drain_config: QueueDrainWorkerConfig,
    disk_cleanup_config: DiskCleanupWorkerConfig,
    probe_config: ConnectivityProbeConfig,
    handle_signals: bool,
}

impl AgentRuntimeConfig {
    /// Run startup recovery and spawn the background workers.
    pub async fn start(self) -> Result<AgentRuntime> {
        let previous_marker = match &self.shutdown_config.marker_path {
            Some(path) => recover_marker(path).await?,
            None => None,
        };

        let database = match self.database {
            Some(database) => database,
            None => Database::open(&self.database_path, self.reader_connections).await?,
        };
        let store = LocalStore::new(database.clone());

        let repaired_entries = store.repair_missing_queue_entries().await?;
        if repaired_entries > 0 {
            warn!(repaired = repaired_entries, "Re-created missing outbox entries");
        }

        for dir in [&self.disk_config.artifact_dir, &self.disk_config.log_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let connectivity = ConnectivityState::default();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store,
            self.backend.clone(),
            connectivity.clone(),
            self.sync_config,
        ));
        let disk = Arc::new(DiskMonitor::new(self.disk_config));
        let coordinator = Arc::new(ShutdownCoordinator::new(self.shutdown_config));
        let capture = CaptureService::new(
            orchestrator.clone(),
            disk.clone(),
            coordinator.subscribe(),
            self.capture_config,
        );

        // Queue drain worker
        let flush_batch_size = self.queue_drain_config.batch_size;
        let drain_worker = QueueDrainWorker::new(orchestrator.clone(), self.queue_drain_config);
        let drain_trigger = drain_worker.trigger_handle();
        let drain_shutdown = drain_worker.shutdown_handle();
        let drain_handle = tokio::spawn(async move {
            drain_worker.run().await;
        });

        // Connectivity probe
        let probe = ConnectivityProbe::new(self.backend.clone(), connectivity, self.probe_config)
            .with_online_trigger(drain_trigger.clone());
        let probe_shutdown = probe.shutdown_handle();
        let probe_handle = tokio::spawn(async move {
            probe.run().await;
        });

        // Disk cleanup worker
        let cleanup_worker = DiskCleanupWorker::new(disk.clone(), self.disk_cleanup_config);
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        coordinator.register_component("connectivity_probe", PRIORITY_WORKERS, move || {
            stop_worker(probe_shutdown, probe_handle)
        });
        coordinator.register_component("disk_cleanup_worker", PRIORITY_WORKERS, move || {
            stop_worker(cleanup_shutdown, cleanup_handle)
        });
        coordinator.register_component("queue_drain_worker", PRIORITY_WORKERS, move || {
            stop_worker(drain_shutdown, drain_handle)
        });

        let flush_orchestrator = orchestrator.clone();
        coordinator.register_component("sync_flush", PRIORITY_SYNC_FLUSH, move || async move {
            flush_outbox(&flush_orchestrator, flush_batch_size).await?;
            anyhow::Ok(())
        });

        let db = database.clone();
        coordinator.register_component("database", PRIORITY_DATABASE, move || async move {
            db.close().await;
            anyhow::Ok(())
        });

        let signal_handle = if self.handle_signals {
            Some(spawn_signal_listener(coordinator.clone())?)
        } else {
            None
        };

        info!(
            device_id = %self.device_id,
            repaired_entries,
            recovered_marker = previous_marker.is_some(),
            "AgentRuntime started"
        );

        Ok(AgentRuntime {
            database,
            orchestrator,
            disk,
            capture,
            coordinator,
            drain_trigger,
            device_id: self.device_id,
            previous_marker,
            repaired_entries,
            signal_handle,
        })
    }
}

/// Point-in-time view of the whole agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    /// Lifecycle phase.
    pub phase: ShutdownPhase,
    /// Outbox, connectivity and breaker state.
    pub sync: SyncStatus,
    /// Disk usage and level.
    pub disk: DiskStatus,
}

/// A running kiosk agent.
///
/// The runtime manages:
/// - Queue-drain worker pushing the outbox to the backend
/// - Connectivity probe keeping the online flag current
/// - Disk-cleanup worker reclaiming photo and log space
/// - Signal listener for SIGTERM/SIGINT (optional)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct AgentRuntime {
    database: Database,
    orchestrator: Arc<SyncOrchestrator>,
    disk: Arc<DiskMonitor>,
    capture: CaptureService,
    coordinator: Arc<ShutdownCoordinator>,
    drain_trigger: Arc<Notify>,
    device_id: String,
    previous_marker: Option<ShutdownMarker>,
    repaired_entries: u64,
    signal_handle: Option<JoinHandle<()>>,
}

impl AgentRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new()
    }

    /// Record a capture stamped with this kiosk's device id.
    pub async fn capture(
        &self,
        record: NewRecord,
        artifact: Option<Artifact>,
    ) -> attendsync_core::Result<CaptureReceipt> {
        self.capture.record(record, artifact, &self.device_id).await
    }

    /// The capture service, for callers that stamp their own device id.
    pub fn capture_service(&self) -> &CaptureService {
        &self.capture
    }

    /// The sync orchestrator.
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// The disk monitor.
    pub fn disk_monitor(&self) -> &Arc<DiskMonitor> {
        &self.disk
    }

    /// The shutdown coordinator, for registering extra teardowns.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// The underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Marker left by the previous run, if one was found at startup.
    pub fn previous_marker(&self) -> Option<&ShutdownMarker> {
        self.previous_marker.as_ref()
    }

    /// Outbox entries re-created during startup recovery.
    pub fn repaired_entries(&self) -> u64 {
        self.repaired_entries
    }

    /// Ask the queue-drain worker for an immediate pass.
    pub fn sync_now(&self) {
        self.drain_trigger.notify_one();
    }

    /// Push every unsynced record, abandoned ones included.
    pub async fn force_sync(&self) -> attendsync_core::Result<BatchReport> {
        self.orchestrator.force_sync_all().await
    }

    /// Current status of sync, disk and lifecycle.
    pub async fn status(&self) -> attendsync_core::Result<AgentStatus> {
        Ok(AgentStatus {
            phase: self.coordinator.phase(),
            sync: self.orchestrator.get_status().await?,
            disk: self.disk.status(),
        })
    }

    /// Check if the runtime is still admitting captures.
    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    /// Wait until shutdown has completed, whoever triggered it.
    pub async fn wait(&self) {
        let mut phase = self.coordinator.subscribe();
        let _ = phase.wait_for(|p| *p == ShutdownPhase::Stopped).await;
    }

    /// Gracefully shut down the runtime.
    ///
    /// Returns the marker written for this shutdown, or `None` if a shutdown
    /// was already started (by a signal or an earlier call). In that case
    /// this still returns only once the other shutdown has reached
    /// [`ShutdownPhase::Stopped`].
    pub async fn shutdown(&self) -> Option<ShutdownMarker> {
        match self.coordinator.shutdown().await {
            Some(marker) => Some(marker),
            None => {
                self.wait().await;
                None
            }
        }
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        // Once draining has started the listener may be driving teardown.
        if let Some(handle) = &self.signal_handle
            && self.coordinator.is_running()
        {
            handle.abort();
        }
    }
}

/// Read, log and remove the previous run's marker.
async fn recover_marker(path: &std::path::Path) -> Result<Option<ShutdownMarker>> {
    let marker = shutdown::take_marker(path).await?;
    match &marker {
        Some(m) if m.clean_shutdown => info!(
            shutdown_time = %m.shutdown_time,
            components = m.components.len(),
            "Previous run shut down cleanly"
        ),
        Some(m) => warn!(
            shutdown_time = %m.shutdown_time,
            components = ?m.components,
            "Previous shutdown was not clean"
        ),
        None => info!(
            path = %path.display(),
            "No shutdown marker found, first start or previous run crashed"
        ),
    }
    Ok(marker)
}

/// One bounded delivery pass before the database closes.
async fn flush_outbox(
    orchestrator: &SyncOrchestrator,
    batch_size: i64,
) -> attendsync_core::Result<BatchReport> {
    let report = orchestrator.process_queue(batch_size).await?;
    let remaining = orchestrator.store().outbox().size().await?;
    if report.skipped {
        warn!(remaining, "Final sync pass skipped, a batch was still in flight");
    } else {
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            remaining,
            "Final sync pass complete"
        );
    }
    Ok(report)
}

/// Aborts the task when dropped, so a teardown cut short by its timeout does
/// not leave the worker running.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn stop_worker(shutdown: Arc<Notify>, handle: JoinHandle<()>) -> anyhow::Result<()> {
    let _guard = AbortOnDrop(handle.abort_handle());
    shutdown.notify_one();
    handle
        .await
        .map_err(|e| anyhow::anyhow!("worker task failed: {}", e))
}

/// Install SIGTERM/SIGINT handlers and spawn a task that starts shutdown on
/// the first one. The task exits on its own once shutdown starts elsewhere.
fn spawn_signal_listener(
    coordinator: Arc<ShutdownCoordinator>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut phase = coordinator.subscribe();

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = phase.wait_for(|p| *p != ShutdownPhase::Running) => return,
        };
        info!(signal = name, "Shutdown signal received");
        coordinator.shutdown().await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use attendsync_core::remote::{RemoteError, RemoteRecord};
    use attendsync_core::AttendanceStatus;

    /// Backend whose inserts never finish.
    #[derive(Default)]
    struct HangingBackend {
        inserts: AtomicU32,
    }

    #[async_trait]
    impl RemoteBackend for HangingBackend {
        async fn insert_record(
            &self,
            _resource: &str,
            _record: &RemoteRecord,
        ) -> std::result::Result<String, RemoteError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("1".to_string())
        }

        async fn upload_artifact(
            &self,
            object: &str,
            _bytes: Vec<u8>,
        ) -> std::result::Result<String, RemoteError> {
            Ok(object.to_string())
        }

        async fn probe(&self) -> std::result::Result<Duration, RemoteError> {
            Ok(Duration::from_millis(1))
        }
    }

    #[tokio::test]
    async fn test_flush_reports_skip_while_batch_in_flight() {
        let backend = Arc::new(HangingBackend::default());
        let store = LocalStore::new(Database::in_memory().await.unwrap());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store,
            backend.clone(),
            ConnectivityState::new(true),
            SyncConfig::default(),
        ));
        orchestrator
            .store()
            .save_record_with_queue(
                &NewRecord::attendance("2021001", AttendanceStatus::Present),
                None,
                "kiosk-test",
            )
            .await
            .unwrap();

        let running = orchestrator.clone();
        let batch = tokio::spawn(async move { running.process_queue(10).await });
        for _ in 0..200 {
            if backend.inserts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.inserts.load(Ordering::SeqCst), 1);

        let report = flush_outbox(&orchestrator, 10).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.processed, 0);
        assert_eq!(orchestrator.store().outbox().size().await.unwrap(), 1);

        batch.abort();
    }

    #[tokio::test]
    async fn test_flush_offline_is_not_reported_as_skip() {
        let store = LocalStore::new(Database::in_memory().await.unwrap());
        let orchestrator = SyncOrchestrator::new(
            store,
            Arc::new(HangingBackend::default()),
            ConnectivityState::new(false),
            SyncConfig::default(),
        );

        let report = flush_outbox(&orchestrator, 10).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_stop_worker_aborts_when_dropped() {
        let started = Arc::new(Notify::new());
        let signal = started.clone();
        let handle = tokio::spawn(async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let abort = handle.abort_handle();
        started.notified().await;

        let stop = stop_worker(Arc::new(Notify::new()), handle);
        assert!(tokio::time::timeout(Duration::from_millis(50), stop).await.is_err());

        for _ in 0..200 {
            if abort.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(abort.is_finished());
    }
}
