// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capture entry point.
//!
//! The capture pipeline hands every event to [`CaptureService::record`]. The
//! caller only learns whether the record was saved; the sync outcome that
//! comes back with it is informational and never turns a save into an error.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::disk::DiskMonitor;
use crate::error::{CoreError, Result};
use crate::model::NewRecord;
use crate::shutdown::ShutdownPhase;
use crate::sync::{SyncOrchestrator, SyncOutcome};

const MB: u64 = 1024 * 1024;

/// Binary evidence attached to a record, typically a photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// File contents.
    pub bytes: Vec<u8>,
    /// File extension without the dot, e.g. `jpg`.
    pub extension: String,
}

impl Artifact {
    /// A JPEG image.
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extension: "jpg".to_string(),
        }
    }
}

/// What the capture caller gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureReceipt {
    /// Local record ID.
    pub record_id: i64,
    /// Outcome of the immediate sync attempt.
    pub sync: SyncOutcome,
}

/// Capture settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Where artifacts are written.
    pub artifact_dir: PathBuf,
    /// Free space required on top of the artifact itself.
    pub required_free_mb: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(".data/photos"),
            required_free_mb: 10,
        }
    }
}

/// Admits captured records into the store and triggers their first sync.
#[derive(Debug, Clone)]
pub struct CaptureService {
    orchestrator: Arc<SyncOrchestrator>,
    disk: Arc<DiskMonitor>,
    phase: watch::Receiver<ShutdownPhase>,
    config: CaptureConfig,
}

impl CaptureService {
    /// Create the service. `phase` usually comes from
    /// [`crate::shutdown::ShutdownCoordinator::subscribe`].
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        disk: Arc<DiskMonitor>,
        phase: watch::Receiver<ShutdownPhase>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            orchestrator,
            disk,
            phase,
            config,
        }
    }

    /// Save a record (and its artifact) and attempt to sync it.
    ///
    /// Refused with [`CoreError::ShuttingDown`] once draining has started and
    /// with [`CoreError::InsufficientDiskSpace`] when the disk is critical; in
    /// both cases nothing is written.
    pub async fn record(
        &self,
        record: NewRecord,
        artifact: Option<Artifact>,
        device_id: &str,
    ) -> Result<CaptureReceipt> {
        if *self.phase.borrow() != ShutdownPhase::Running {
            return Err(CoreError::ShuttingDown);
        }

        let artifact_mb = artifact
            .as_ref()
            .map(|a| (a.bytes.len() as u64).div_ceil(MB))
            .unwrap_or(0);
        self.disk
            .ensure_available(self.config.required_free_mb.saturating_add(artifact_mb))?;

        let artifact_path = match artifact {
            Some(artifact) => Some(self.write_artifact(&record, artifact).await?),
            None => None,
        };
        let artifact_str = artifact_path.as_ref().map(|p| p.to_string_lossy().into_owned());

        let store = self.orchestrator.store();
        let record_id = match store
            .save_record_with_queue(&record, artifact_str.as_deref(), device_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if let Some(path) = &artifact_path
                    && let Err(rm) = tokio::fs::remove_file(path).await
                {
                    warn!(path = %path.display(), error = %rm, "Failed to remove orphaned artifact");
                }
                return Err(e);
            }
        };

        info!(
            record_id,
            kind = %record.kind(),
            subject_id = %record.subject_id,
            has_artifact = artifact_path.is_some(),
            "Record captured"
        );

        let sync = match store.get_record(record_id).await {
            Ok(Some(saved)) => match self.orchestrator.sync_one(&saved).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(record_id, error = %e, "Immediate sync hit a storage error");
                    SyncOutcome::Failed(e.to_string())
                }
            },
            Ok(None) => SyncOutcome::Queued,
            Err(e) => {
                warn!(record_id, error = %e, "Could not reload record for sync");
                SyncOutcome::Queued
            }
        };
        debug!(record_id, sync = ?sync, "Capture complete");

        Ok(CaptureReceipt { record_id, sync })
    }

    async fn write_artifact(&self, record: &NewRecord, artifact: Artifact) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.artifact_dir)
            .await
            .map_err(|e| CoreError::io("create_artifact_dir", e))?;

        let suffix = Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{}_{}_{}_{}.{}",
            record.kind(),
            sanitize(&record.subject_id),
            Utc::now().format("%Y%m%dT%H%M%S"),
            &suffix[..8],
            artifact.extension,
        );
        let path = self.config.artifact_dir.join(file_name);

        tokio::fs::write(&path, &artifact.bytes)
            .await
            .map_err(|e| CoreError::io("write_artifact", e))?;

        Ok(path)
    }
}

fn sanitize(subject_id: &str) -> String {
    subject_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
