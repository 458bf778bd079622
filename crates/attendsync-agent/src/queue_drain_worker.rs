// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that drains the outbox.
//!
//! Runs one bounded `process_queue` pass every `poll_interval`, and
//! immediately whenever the trigger handle is notified (the connectivity probe
//! does this when the backend comes back). After each pass it checks the age
//! of the oldest pending entry and warns when records are going stale.

use std::sync::Arc;
use std::time::Duration;

use attendsync_core::{BatchReport, SyncOrchestrator};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Configuration for the queue-drain worker.
#[derive(Debug, Clone)]
pub struct QueueDrainWorkerConfig {
    /// How often to drain the outbox.
    pub poll_interval: Duration,
    /// Maximum entries per pass.
    pub batch_size: i64,
    /// Oldest-entry age that triggers a staleness warning.
    pub stale_after: Duration,
}

impl Default for QueueDrainWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 50,
            stale_after: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Background worker that periodically pushes queued records to the backend.
pub struct QueueDrainWorker {
    orchestrator: Arc<SyncOrchestrator>,
    config: QueueDrainWorkerConfig,
    shutdown: Arc<Notify>,
    trigger: Arc<Notify>,
}

impl QueueDrainWorker {
    /// Create a new queue-drain worker.
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: QueueDrainWorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: Arc::new(Notify::new()),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Get a handle that requests an immediate drain.
    ///
    /// Notifications coalesce: several triggers while a pass is running
    /// result in one extra pass.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Run the worker loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Queue drain worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Queue drain worker received shutdown signal");
                    break;
                }

                _ = self.trigger.notified() => {
                    debug!("Immediate queue drain requested");
                    self.tick().await;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Queue drain worker stopped");
    }

    async fn tick(&self) {
        if let Err(e) = self.drain_once().await {
            error!(error = %e, "Queue drain failed");
        }
        self.check_staleness().await;
    }

    /// Run a single drain pass.
    pub async fn drain_once(&self) -> attendsync_core::Result<BatchReport> {
        let report = self.orchestrator.process_queue(self.config.batch_size).await?;

        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                deferred = report.deferred,
                abandoned = report.abandoned,
                "Queue drain pass complete"
            );
        }

        Ok(report)
    }

    /// Warn if the oldest pending entry is older than `stale_after`.
    ///
    /// Returns the observed age when it is over the threshold.
    pub async fn check_staleness(&self) -> Option<Duration> {
        let age = match self.orchestrator.store().outbox().oldest_pending_age().await {
            Ok(age) => age?,
            Err(e) => {
                debug!(error = %e, "Failed to read oldest outbox entry");
                return None;
            }
        };

        if age < self.config.stale_after {
            return None;
        }

        warn!(
            oldest_pending_secs = age.as_secs(),
            threshold_secs = self.config.stale_after.as_secs(),
            online = self.orchestrator.connectivity().is_online(),
            "Outbox has stale entries"
        );
        Some(age)
    }
}
