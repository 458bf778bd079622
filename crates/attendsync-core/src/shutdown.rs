// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graceful shutdown coordination.
//!
//! Components register an async teardown with a priority. On shutdown the
//! coordinator moves to `Draining` (capture admission stops), runs the
//! teardowns from highest to lowest priority, each in its own task under
//! `min(component_timeout, remaining overall budget)`, writes a marker file
//! and moves to `Stopped`.
//!
//! A failing, panicking or slow teardown never prevents later ones from
//! running. Teardowns still waiting when the overall budget is spent are
//! skipped.

use std::cmp::Reverse;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{CoreError, Result};

/// Lifecycle phase. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    /// Normal operation.
    Running,
    /// Teardowns are running; new work is refused.
    Draining,
    /// Everything has been torn down.
    Stopped,
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Budget for the whole teardown sequence.
    pub overall_timeout: Duration,
    /// Budget for any single teardown.
    pub component_timeout: Duration,
    /// Where to write the shutdown marker, if anywhere.
    pub marker_path: Option<PathBuf>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(30),
            component_timeout: Duration::from_secs(10),
            marker_path: None,
        }
    }
}

/// How one teardown ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComponentOutcome {
    /// Finished without error.
    Completed,
    /// Returned an error.
    Failed {
        /// Error text.
        error: String,
    },
    /// Panicked.
    Panicked,
    /// Exceeded its budget and was aborted.
    TimedOut,
    /// Not started because the overall budget was spent.
    Skipped,
}

/// Teardown record in the marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentReport {
    /// Component name.
    pub name: String,
    /// Registration priority.
    pub priority: i32,
    /// Result.
    #[serde(flatten)]
    pub outcome: ComponentOutcome,
    /// Time spent, in milliseconds.
    pub elapsed_ms: u64,
}

/// Marker persisted at the end of a shutdown and read at the next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownMarker {
    /// When the shutdown finished.
    pub shutdown_time: DateTime<Utc>,
    /// Whether every teardown completed.
    pub clean_shutdown: bool,
    /// Per-component results in execution order.
    pub components: Vec<ComponentReport>,
}

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Registration {
    name: String,
    priority: i32,
    teardown: Teardown,
}

/// Orders and time-bounds component teardown.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    phase: watch::Sender<ShutdownPhase>,
    components: Mutex<Vec<Registration>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the `Running` phase.
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase, _rx) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            phase,
            components: Mutex::new(Vec::new()),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Whether new work may still be admitted.
    pub fn is_running(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }

    /// Observe phase changes.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Register a teardown. Higher priorities run first; equal priorities
    /// keep registration order.
    pub fn register_component<F, Fut>(&self, name: impl Into<String>, priority: i32, teardown: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        info!(component = %name, priority, "Shutdown component registered");
        self.components
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Registration {
                name,
                priority,
                teardown: Box::new(move || teardown().boxed()),
            });
    }

    /// Run the shutdown sequence.
    ///
    /// Returns the marker contents, or `None` if a shutdown already started.
    pub async fn shutdown(&self) -> Option<ShutdownMarker> {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            return None;
        }

        let mut components = std::mem::take(
            &mut *self
                .components
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        components.sort_by_key(|c| Reverse(c.priority));

        info!(
            components = components.len(),
            overall_timeout_secs = self.config.overall_timeout.as_secs(),
            "Shutdown started"
        );

        let deadline = Instant::now() + self.config.overall_timeout;
        let mut reports = Vec::with_capacity(components.len());

        for component in components {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(component = %component.name, "Shutdown budget spent, teardown skipped");
                reports.push(ComponentReport {
                    name: component.name,
                    priority: component.priority,
                    outcome: ComponentOutcome::Skipped,
                    elapsed_ms: 0,
                });
                continue;
            }

            let budget = remaining.min(self.config.component_timeout);
            let begun = Instant::now();
            let handle = tokio::spawn((component.teardown)());
            let abort = handle.abort_handle();

            let outcome = match tokio::time::timeout(budget, handle).await {
                Ok(Ok(Ok(()))) => ComponentOutcome::Completed,
                Ok(Ok(Err(e))) => {
                    error!(component = %component.name, error = %e, "Teardown failed");
                    ComponentOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                Ok(Err(join_err)) => {
                    error!(component = %component.name, error = %join_err, "Teardown panicked");
                    ComponentOutcome::Panicked
                }
                Err(_) => {
                    abort.abort();
                    warn!(
                        component = %component.name,
                        budget_ms = budget.as_millis() as u64,
                        "Teardown timed out"
                    );
                    ComponentOutcome::TimedOut
                }
            };

            let elapsed_ms = begun.elapsed().as_millis() as u64;
            if outcome == ComponentOutcome::Completed {
                info!(component = %component.name, elapsed_ms, "Component stopped");
            }
            reports.push(ComponentReport {
                name: component.name,
                priority: component.priority,
                outcome,
                elapsed_ms,
            });
        }

        let marker = ShutdownMarker {
            shutdown_time: Utc::now(),
            clean_shutdown: reports
                .iter()
                .all(|r| r.outcome == ComponentOutcome::Completed),
            components: reports,
        };

        if let Some(path) = &self.config.marker_path
            && let Err(e) = write_marker(path, &marker).await
        {
            error!(path = %path.display(), error = %e, "Failed to write shutdown marker");
        }

        self.phase.send_replace(ShutdownPhase::Stopped);
        info!(clean = marker.clean_shutdown, "Shutdown complete");

        Some(marker)
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Write the marker via a temporary file and rename.
pub async fn write_marker(path: &Path, marker: &ShutdownMarker) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::io("create_dir", e))?;
    }

    let tmp = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(marker)?;
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| CoreError::io("write_marker", e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CoreError::io("rename_marker", e))?;
    Ok(())
}

/// Read the marker left by the previous run, if any.
pub async fn read_marker(path: &Path) -> Result<Option<ShutdownMarker>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::io("read_marker", e)),
    }
}

/// Read and delete the previous marker. A corrupt marker is deleted and
/// reported as absent.
pub async fn take_marker(path: &Path) -> Result<Option<ShutdownMarker>> {
    let marker = match read_marker(path).await {
        Ok(marker) => marker,
        Err(CoreError::InvalidPayload { message, .. }) => {
            warn!(path = %path.display(), error = %message, "Discarding corrupt shutdown marker");
            None
        }
        Err(e) => return Err(e),
    };

    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(CoreError::io("remove_marker", e)),
    }

    Ok(marker)
}
