// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sync orchestrator.
//!
//! The only component that talks to the network. It delivers records either
//! immediately after capture ([`SyncOrchestrator::sync_one`]) or in batches
//! from the outbox ([`SyncOrchestrator::process_queue`]), each remote
//! endpoint gated by its own circuit breaker.
//!
//! Delivery is at-least-once: every write carries the record's idempotency
//! key and the backend is expected to upsert on it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{BreakerConfig, BreakerError, BreakerStatus, CircuitBreaker};
use crate::connectivity::ConnectivityState;
use crate::error::Result;
use crate::model::{OutboxEntry, OutboxPayload, Record, RecordKind};
use crate::outbox::{Enqueued, OutboxQueue};
use crate::remote::{RemoteBackend, RemoteError, RemoteRecord, artifact_object_name};
use crate::store::LocalStore;

/// A remote endpoint with its own breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// Attendance records.
    Attendance,
    /// Student registrations.
    Students,
    /// Artifact uploads.
    Artifacts,
}

impl Endpoint {
    /// Every endpoint.
    pub const ALL: [Endpoint; 3] = [Endpoint::Attendance, Endpoint::Students, Endpoint::Artifacts];

    /// Endpoint a record kind is written to.
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Attendance => Endpoint::Attendance,
            RecordKind::Student => Endpoint::Students,
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Attendance => "attendance",
            Endpoint::Students => "students",
            Endpoint::Artifacts => "artifacts",
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Master switch; when off nothing touches the network.
    pub enabled: bool,
    /// Failed attempts after which an entry is abandoned.
    pub max_retries: i64,
    /// Thresholds shared by every endpoint breaker.
    pub breaker: BreakerConfig,
    /// How long [`SyncOrchestrator::force_sync_all`] waits for connectivity.
    pub online_wait: Duration,
    /// How long [`SyncOrchestrator::force_sync_all`] waits for a running batch.
    pub batch_lock_wait: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            breaker: BreakerConfig::default(),
            online_wait: Duration::from_secs(10),
            batch_lock_wait: Duration::from_secs(30),
        }
    }
}

/// Result of an immediate sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Accepted by the backend under this remote ID.
    Synced(String),
    /// Left in the outbox without a network attempt.
    Queued,
    /// Attempted and failed; the record stays queued.
    Failed(String),
}

/// Counts from one outbox pass.
///
/// An entry that fails and hits the retry ceiling in the same pass counts as
/// both `failed` and `abandoned`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Entries looked at.
    pub processed: u64,
    /// Entries delivered (or found already synced).
    pub succeeded: u64,
    /// Delivery attempts that failed.
    pub failed: u64,
    /// Entries left untouched because their breaker was open.
    pub deferred: u64,
    /// Entries dropped after exhausting retries or failing to decode.
    pub abandoned: u64,
    /// Another batch was already running; nothing was done.
    pub skipped: bool,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncTotals {
    /// Records delivered.
    pub synced: u64,
    /// Failed delivery attempts.
    pub failed: u64,
    /// Records abandoned.
    pub abandoned: u64,
}

/// Dashboard view of the sync subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Master switch.
    pub enabled: bool,
    /// Connectivity belief.
    pub online: bool,
    /// Outbox size.
    pub queue_size: i64,
    /// Outbox size per record type.
    pub queue_by_type: BTreeMap<String, i64>,
    /// Records not yet accepted by the backend.
    pub unsynced_count: i64,
    /// Records dropped after exhausting retries.
    pub abandoned_count: i64,
    /// Age of the oldest outbox entry.
    pub oldest_pending_age_secs: Option<u64>,
    /// Last time any record was delivered.
    pub last_sync: Option<DateTime<Utc>>,
    /// Last probe latency.
    pub latency_ms: Option<u64>,
    /// Per-endpoint breakers.
    pub breakers: Vec<BreakerStatus>,
    /// Lifetime counters.
    pub totals: SyncTotals,
}

#[derive(Debug)]
struct Breakers {
    attendance: CircuitBreaker,
    students: CircuitBreaker,
    artifacts: CircuitBreaker,
}

impl Breakers {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            attendance: CircuitBreaker::new(Endpoint::Attendance.name(), config.clone()),
            students: CircuitBreaker::new(Endpoint::Students.name(), config.clone()),
            artifacts: CircuitBreaker::new(Endpoint::Artifacts.name(), config.clone()),
        }
    }

    fn get(&self, endpoint: Endpoint) -> &CircuitBreaker {
        match endpoint {
            Endpoint::Attendance => &self.attendance,
            Endpoint::Students => &self.students,
            Endpoint::Artifacts => &self.artifacts,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    synced: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

/// Delivers records to the backend.
pub struct SyncOrchestrator {
    store: LocalStore,
    queue: OutboxQueue,
    backend: Arc<dyn RemoteBackend>,
    connectivity: ConnectivityState,
    breakers: Breakers,
    config: SyncConfig,
    enabled: AtomicBool,
    batch_guard: Mutex<()>,
    last_sync: std::sync::Mutex<Option<DateTime<Utc>>>,
    counters: Counters,
}

impl SyncOrchestrator {
    /// Create an orchestrator with one closed breaker per endpoint.
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        connectivity: ConnectivityState,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue: store.outbox(),
            store,
            backend,
            connectivity,
            breakers: Breakers::new(&config.breaker),
            enabled: AtomicBool::new(config.enabled),
            config,
            batch_guard: Mutex::new(()),
            last_sync: std::sync::Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Local store the orchestrator retires records through.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Connectivity handle.
    pub fn connectivity(&self) -> &ConnectivityState {
        &self.connectivity
    }

    /// Whether sync is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Turn sync on or off at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Sync toggled");
    }

    /// Breaker guarding `endpoint`.
    pub fn breaker(&self, endpoint: Endpoint) -> &CircuitBreaker {
        self.breakers.get(endpoint)
    }

    /// Force every breaker closed.
    pub fn reset_breakers(&self) {
        for endpoint in Endpoint::ALL {
            self.breakers.get(endpoint).reset();
        }
    }

    fn can_attempt(&self) -> bool {
        self.is_enabled() && self.connectivity.is_online()
    }

    /// Try to deliver one freshly captured record.
    ///
    /// Never removes the record from the outbox unless the backend accepted
    /// it. Only local storage failures are returned as errors.
    pub async fn sync_one(&self, record: &Record) -> Result<SyncOutcome> {
        if record.synced {
            return Ok(SyncOutcome::Synced(record.remote_id.clone().unwrap_or_default()));
        }

        let endpoint = Endpoint::for_kind(record.kind);
        if !self.can_attempt() || self.breakers.get(endpoint).is_open() {
            self.store.ensure_queued(record.id).await?;
            debug!(record_id = record.id, "Record queued without attempt");
            return Ok(SyncOutcome::Queued);
        }

        let payload = OutboxPayload::from(record);
        match self.deliver(&payload).await {
            Ok(remote_id) => {
                self.store.mark_synced_and_cleanup(record.id, &remote_id).await?;
                self.on_synced();
                Ok(SyncOutcome::Synced(remote_id))
            }
            Err(BreakerError::Open { .. }) => {
                self.store.ensure_queued(record.id).await?;
                Ok(SyncOutcome::Queued)
            }
            Err(BreakerError::Inner(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.store.ensure_queued(record.id).await?;
                warn!(record_id = record.id, error = %e, "Immediate sync failed, record stays queued");
                Ok(SyncOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Drain up to `batch_size` outbox entries.
    ///
    /// Returns zero counts when sync is disabled or offline, and
    /// `skipped = true` when another batch is already running.
    pub async fn process_queue(&self, batch_size: i64) -> Result<BatchReport> {
        if !self.can_attempt() {
            return Ok(BatchReport::default());
        }

        let Ok(_guard) = self.batch_guard.try_lock() else {
            debug!("Batch already in flight, skipping");
            return Ok(BatchReport {
                skipped: true,
                ..BatchReport::default()
            });
        };

        self.drain(batch_size).await
    }

    /// Push every unsynced record, abandoned ones included.
    ///
    /// Waits (bounded) for connectivity and for any running batch, repairs
    /// missing outbox entries, re-queues abandoned records and makes one
    /// delivery attempt per entry.
    pub async fn force_sync_all(&self) -> Result<BatchReport> {
        if !self.is_enabled() {
            return Ok(BatchReport::default());
        }

        if !self.connectivity.wait_online(self.config.online_wait).await {
            warn!("Forced sync aborted, backend unreachable");
            return Ok(BatchReport::default());
        }

        let Ok(_guard) = tokio::time::timeout(self.config.batch_lock_wait, self.batch_guard.lock()).await
        else {
            warn!("Forced sync timed out waiting for running batch");
            return Ok(BatchReport {
                skipped: true,
                ..BatchReport::default()
            });
        };

        self.store.repair_missing_queue_entries().await?;

        let unsynced = self.store.count_unsynced().await?;
        let mut requeued = 0u64;
        for record in self.store.unsynced_records(unsynced).await? {
            if let Some(Enqueued::Created(_)) = self.store.ensure_queued(record.id).await? {
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!(requeued, "Abandoned records re-queued by forced sync");
        }

        let size = self.queue.size().await?;
        let report = self.drain(size.max(1)).await?;
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            abandoned = report.abandoned,
            "Forced sync finished"
        );
        Ok(report)
    }

    async fn drain(&self, batch_size: i64) -> Result<BatchReport> {
        let entries = self.queue.peek_pending(batch_size).await?;
        let mut report = BatchReport::default();

        for entry in entries {
            report.processed += 1;

            if entry.retry_count >= self.config.max_retries {
                self.abandon(&entry, "retry ceiling reached").await?;
                report.abandoned += 1;
                continue;
            }

            let payload = match entry.decode_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    self.abandon(&entry, &e.to_string()).await?;
                    report.abandoned += 1;
                    continue;
                }
            };

            match self.deliver(&payload).await {
                Ok(remote_id) => {
                    if !self
                        .store
                        .mark_synced_and_cleanup(entry.record_id, &remote_id)
                        .await?
                    {
                        self.queue.dequeue(entry.queue_id).await?;
                    }
                    self.on_synced();
                    report.succeeded += 1;
                }
                Err(BreakerError::Open { name }) => {
                    debug!(queue_id = entry.queue_id, breaker = %name, "Entry deferred");
                    report.deferred += 1;
                }
                Err(BreakerError::Inner(e)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    report.failed += 1;

                    let retry_count = self.queue.increment_retry(entry.queue_id, &e.to_string()).await?;
                    warn!(
                        queue_id = entry.queue_id,
                        record_id = entry.record_id,
                        retry_count,
                        transient = e.is_transient(),
                        error = %e,
                        "Delivery failed"
                    );

                    if retry_count.is_some_and(|count| count >= self.config.max_retries) {
                        self.abandon(&entry, &e.to_string()).await?;
                        report.abandoned += 1;
                    }
                }
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                deferred = report.deferred,
                abandoned = report.abandoned,
                "Outbox batch processed"
            );
        }

        Ok(report)
    }

    async fn abandon(&self, entry: &OutboxEntry, reason: &str) -> Result<()> {
        error!(
            queue_id = entry.queue_id,
            record_id = entry.record_id,
            record_type = %entry.record_type,
            retry_count = entry.retry_count,
            reason,
            payload = %entry.payload,
            "Sync permanently failed, record abandoned"
        );

        if !self.store.abandon_and_dequeue(entry.record_id, reason).await? {
            self.queue.dequeue(entry.queue_id).await?;
        }
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn deliver(&self, payload: &OutboxPayload) -> std::result::Result<String, BreakerError<RemoteError>> {
        let artifact_url = match payload.artifact_path.as_deref() {
            Some(path) => self.upload_artifact(Path::new(path)).await,
            None => None,
        };

        let kind = payload.kind();
        let body = RemoteRecord::from_payload(payload, artifact_url);
        self.breakers
            .get(Endpoint::for_kind(kind))
            .call(
                self.backend.insert_record(kind.resource(), &body),
                RemoteError::is_transient,
            )
            .await
    }

    /// Upload an artifact. Failures are logged and yield `None` so the
    /// record write still goes ahead.
    async fn upload_artifact(&self, path: &Path) -> Option<String> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Artifact unreadable, syncing record without it");
                return None;
            }
        };

        let object = artifact_object_name(&bytes, path);
        match self
            .breakers
            .get(Endpoint::Artifacts)
            .call(self.backend.upload_artifact(&object, bytes), RemoteError::is_transient)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Artifact upload failed, syncing record without it");
                None
            }
        }
    }

    fn on_synced(&self) {
        self.counters.synced.fetch_add(1, Ordering::Relaxed);
        *self
            .last_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
    }

    /// Snapshot for dashboards. Reads only.
    pub async fn get_status(&self) -> Result<SyncStatus> {
        let states = self.store.count_by_state().await?;
        let last_sync = *self
            .last_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(SyncStatus {
            enabled: self.is_enabled(),
            online: self.connectivity.is_online(),
            queue_size: self.queue.size().await?,
            queue_by_type: self.queue.size_by_type().await?,
            unsynced_count: self.store.count_unsynced().await?,
            abandoned_count: states.abandoned,
            oldest_pending_age_secs: self.queue.oldest_pending_age().await?.map(|a| a.as_secs()),
            last_sync,
            latency_ms: self.connectivity.latency().map(|l| l.as_millis() as u64),
            breakers: Endpoint::ALL
                .iter()
                .map(|e| self.breakers.get(*e).status())
                .collect(),
            totals: SyncTotals {
                synced: self.counters.synced.load(Ordering::Relaxed),
                failed: self.counters.failed.load(Ordering::Relaxed),
                abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            },
        })
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
