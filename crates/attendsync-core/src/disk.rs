// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Disk-space backpressure.
//!
//! The kiosk stores photos and logs on the same card as the database. The
//! monitor reports free space, refuses new captures when the filesystem is
//! critically full, and reclaims space by deleting:
//!
//! - artifacts older than the retention window (rate-limited unless forced)
//! - `*.log` files older than the log retention window
//! - the oldest artifacts while their total exceeds the size cap
//!
//! Usage that cannot be read is treated as critical.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

const MB: u64 = 1024 * 1024;

/// Monitor thresholds and locations.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Path whose filesystem is measured.
    pub data_dir: PathBuf,
    /// Directory holding captured artifacts.
    pub artifact_dir: PathBuf,
    /// Directory holding log files.
    pub log_dir: PathBuf,
    /// Free percentage at or below which writes are refused.
    pub critical_free_percent: f64,
    /// Free percentage at or below which status reports a warning.
    pub warning_free_percent: f64,
    /// Maximum artifact age.
    pub artifact_retention: Duration,
    /// Maximum log file age.
    pub log_retention: Duration,
    /// Cap on total artifact bytes.
    pub max_artifact_bytes: u64,
    /// Minimum spacing between unforced artifact cleanups.
    pub cleanup_interval: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(".data");
        Self {
            artifact_dir: data_dir.join("photos"),
            log_dir: data_dir.join("logs"),
            data_dir,
            critical_free_percent: 5.0,
            warning_free_percent: 15.0,
            artifact_retention: Duration::from_secs(30 * 24 * 3600),
            log_retention: Duration::from_secs(7 * 24 * 3600),
            max_artifact_bytes: 1024 * MB,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Filesystem usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiskUsage {
    /// Filesystem size.
    pub total_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
    /// Bytes available to unprivileged writers.
    pub free_bytes: u64,
    /// `free_bytes / total_bytes` as a percentage.
    pub free_percent: f64,
}

/// Severity of the current usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskLevel {
    /// Plenty of space.
    Ok,
    /// Below the warning threshold.
    Warning,
    /// Below the critical threshold, or unreadable.
    Critical,
}

/// Usage plus level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskStatus {
    /// Usage, absent if it could not be read.
    pub usage: Option<DiskUsage>,
    /// Severity.
    pub level: DiskLevel,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Files deleted.
    pub deleted_count: u64,
    /// Bytes reclaimed.
    pub freed_bytes: u64,
}

impl CleanupReport {
    fn add(&mut self, other: CleanupReport) {
        self.deleted_count += other.deleted_count;
        self.freed_bytes += other.freed_bytes;
    }
}

#[derive(Debug)]
struct FileEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Read filesystem usage for `path`.
pub fn get_usage(path: &Path) -> Result<DiskUsage> {
    let stats = nix::sys::statvfs::statvfs(path).map_err(|e| CoreError::IoError {
        operation: "statvfs".to_string(),
        details: format!("{}: {}", path.display(), e),
    })?;

    let fragment = stats.fragment_size() as u64;
    let total_bytes = stats.blocks() as u64 * fragment;
    let free_bytes = stats.blocks_available() as u64 * fragment;
    let used_bytes = total_bytes.saturating_sub(stats.blocks_free() as u64 * fragment);
    let free_percent = if total_bytes == 0 {
        0.0
    } else {
        free_bytes as f64 / total_bytes as f64 * 100.0
    };

    Ok(DiskUsage {
        total_bytes,
        used_bytes,
        free_bytes,
        free_percent,
    })
}

/// Disk-space monitor.
#[derive(Debug)]
pub struct DiskMonitor {
    config: DiskConfig,
    last_artifact_cleanup: Mutex<Option<Instant>>,
}

impl DiskMonitor {
    /// Create a monitor.
    pub fn new(config: DiskConfig) -> Self {
        Self {
            config,
            last_artifact_cleanup: Mutex::new(None),
        }
    }

    /// Monitor configuration.
    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Usage of the data directory's filesystem.
    pub fn usage(&self) -> Result<DiskUsage> {
        get_usage(&self.config.data_dir)
    }

    /// Whether a write needing `required_mb` may proceed.
    pub fn check_available(&self, required_mb: u64) -> bool {
        let usage = match self.usage() {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Disk usage unreadable, refusing write");
                return false;
            }
        };

        if usage.free_percent <= self.config.critical_free_percent {
            warn!(
                free_percent = usage.free_percent,
                critical_percent = self.config.critical_free_percent,
                "Disk critically full"
            );
            return false;
        }

        if usage.free_bytes < required_mb.saturating_mul(MB) {
            warn!(
                free_mb = usage.free_bytes / MB,
                required_mb, "Not enough free space for write"
            );
            return false;
        }

        true
    }

    /// Like [`check_available`](Self::check_available) but returns the
    /// refusal as an error.
    pub fn ensure_available(&self, required_mb: u64) -> Result<()> {
        if self.check_available(required_mb) {
            return Ok(());
        }
        let free_mb = self.usage().map(|u| u.free_bytes / MB).unwrap_or(0);
        Err(CoreError::InsufficientDiskSpace {
            required_mb,
            free_mb,
        })
    }

    /// Usage and severity.
    pub fn status(&self) -> DiskStatus {
        match self.usage() {
            Ok(usage) => {
                let level = if usage.free_percent <= self.config.critical_free_percent {
                    DiskLevel::Critical
                } else if usage.free_percent <= self.config.warning_free_percent {
                    DiskLevel::Warning
                } else {
                    DiskLevel::Ok
                };
                DiskStatus {
                    usage: Some(usage),
                    level,
                }
            }
            Err(e) => {
                warn!(error = %e, "Disk usage unreadable");
                DiskStatus {
                    usage: None,
                    level: DiskLevel::Critical,
                }
            }
        }
    }

    /// Delete artifacts older than the retention window.
    ///
    /// Skipped if an unforced cleanup ran within `cleanup_interval`.
    pub async fn cleanup_old_artifacts(&self, force: bool) -> Result<CleanupReport> {
        {
            let mut last = self
                .last_artifact_cleanup
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !force
                && let Some(at) = *last
                && at.elapsed() < self.config.cleanup_interval
            {
                debug!("Artifact cleanup ran recently, skipping");
                return Ok(CleanupReport::default());
            }
            *last = Some(Instant::now());
        }

        let cutoff = retention_cutoff(self.config.artifact_retention);
        let files = collect_files(&self.config.artifact_dir, true).await?;
        let report = delete_older_than(files, cutoff).await;

        if report.deleted_count > 0 {
            info!(
                deleted = report.deleted_count,
                freed_mb = report.freed_bytes / MB,
                "Old artifacts removed"
            );
        }
        Ok(report)
    }

    /// Delete `*.log` files older than the log retention window.
    pub async fn cleanup_old_logs(&self) -> Result<CleanupReport> {
        let cutoff = retention_cutoff(self.config.log_retention);
        let files = collect_files(&self.config.log_dir, false)
            .await?
            .into_iter()
            .filter(|f| f.path.extension().is_some_and(|ext| ext == "log"))
            .collect();
        let report = delete_older_than(files, cutoff).await;

        if report.deleted_count > 0 {
            info!(
                deleted = report.deleted_count,
                freed_mb = report.freed_bytes / MB,
                "Old logs removed"
            );
        }
        Ok(report)
    }

    /// Delete the oldest artifacts until their total size fits the cap.
    pub async fn enforce_size_cap(&self) -> Result<CleanupReport> {
        let mut files = collect_files(&self.config.artifact_dir, true).await?;
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        let mut report = CleanupReport::default();

        if total <= self.config.max_artifact_bytes {
            return Ok(report);
        }

        files.sort_by_key(|f| f.modified);
        for file in files {
            if total <= self.config.max_artifact_bytes {
                break;
            }
            if remove_file(&file.path).await {
                total = total.saturating_sub(file.size);
                report.deleted_count += 1;
                report.freed_bytes += file.size;
            }
        }

        info!(
            deleted = report.deleted_count,
            freed_mb = report.freed_bytes / MB,
            cap_mb = self.config.max_artifact_bytes / MB,
            "Artifact size cap enforced"
        );
        Ok(report)
    }

    /// Age, log and size-cap cleanup in sequence.
    pub async fn auto_cleanup(&self, force: bool) -> Result<CleanupReport> {
        let mut report = self.cleanup_old_artifacts(force).await?;
        report.add(self.cleanup_old_logs().await?);
        report.add(self.enforce_size_cap().await?);
        Ok(report)
    }
}

async fn collect_files(root: &Path, recursive: bool) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CoreError::io("read_dir", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::io("read_dir", e))?
        {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to stat file");
                    continue;
                }
            };

            if metadata.is_dir() {
                if recursive {
                    pending.push(path);
                }
                continue;
            }

            files.push(FileEntry {
                path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    Ok(files)
}

/// Oldest modification time to keep. Retentions reaching past the epoch keep
/// everything.
fn retention_cutoff(retention: Duration) -> SystemTime {
    SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

async fn delete_older_than(files: Vec<FileEntry>, cutoff: SystemTime) -> CleanupReport {
    let mut report = CleanupReport::default();
    for file in files.into_iter().filter(|f| f.modified < cutoff) {
        if remove_file(&file.path).await {
            report.deleted_count += 1;
            report.freed_bytes += file.size;
        }
    }
    report
}

async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}
