// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for reclaiming disk space.
//!
//! Photos older than the retention window, old `*.log` files and photos over
//! the size cap are removed by [`DiskMonitor::auto_cleanup`]. The worker runs
//! it every `poll_interval` and bypasses the monitor's own rate limit when the
//! disk is at the critical level.

use std::sync::Arc;
use std::time::Duration;

use attendsync_core::{CleanupReport, DiskLevel, DiskMonitor};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Configuration for the disk-cleanup worker.
#[derive(Debug, Clone)]
pub struct DiskCleanupWorkerConfig {
    /// How often to run cleanup.
    pub poll_interval: Duration,
}

impl Default for DiskCleanupWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Background worker that keeps the artifact and log directories in check.
pub struct DiskCleanupWorker {
    monitor: Arc<DiskMonitor>,
    config: DiskCleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl DiskCleanupWorker {
    /// Create a new disk-cleanup worker.
    pub fn new(monitor: Arc<DiskMonitor>, config: DiskCleanupWorkerConfig) -> Self {
        Self {
            monitor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup worker loop.
    pub async fn run(&self) {
        info!(
            artifact_dir = %self.monitor.config().artifact_dir.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Disk cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Disk cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_once().await {
                        error!(error = %e, "Disk cleanup failed");
                    }
                }
            }
        }

        info!("Disk cleanup worker stopped");
    }

    /// Run one cleanup pass, forced if the disk is critical.
    pub async fn cleanup_once(&self) -> attendsync_core::Result<CleanupReport> {
        let status = self.monitor.status();
        let force = status.level == DiskLevel::Critical;
        if force {
            warn!(
                free_percent = status.usage.as_ref().map(|u| u.free_percent),
                "Disk space critical, forcing cleanup"
            );
        }

        let report = self.monitor.auto_cleanup(force).await?;
        if report.deleted_count > 0 {
            info!(
                deleted = report.deleted_count,
                freed_bytes = report.freed_bytes,
                forced = force,
                "Disk cleanup complete"
            );
        }
        Ok(report)
    }
}
