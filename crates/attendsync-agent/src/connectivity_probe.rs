// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background probe that keeps [`ConnectivityState`] current.
//!
//! Any HTTP response from the backend's health path counts as reachable; the
//! round-trip time becomes the reported latency. When the flag flips back to
//! online the probe notifies the queue-drain trigger so buffered records go
//! out without waiting for the next poll.

use std::sync::Arc;
use std::time::Duration;

use attendsync_core::{ConnectivityState, RemoteBackend};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Configuration for the connectivity probe.
#[derive(Debug, Clone)]
pub struct ConnectivityProbeConfig {
    /// How often to probe the backend.
    pub poll_interval: Duration,
}

impl Default for ConnectivityProbeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Background worker that pings the backend health path.
pub struct ConnectivityProbe {
    backend: Arc<dyn RemoteBackend>,
    connectivity: ConnectivityState,
    config: ConnectivityProbeConfig,
    shutdown: Arc<Notify>,
    on_online: Option<Arc<Notify>>,
}

impl ConnectivityProbe {
    /// Create a new probe.
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        connectivity: ConnectivityState,
        config: ConnectivityProbeConfig,
    ) -> Self {
        Self {
            backend,
            connectivity,
            config,
            shutdown: Arc::new(Notify::new()),
            on_online: None,
        }
    }

    /// Notify `trigger` whenever the backend becomes reachable again.
    pub fn with_online_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.on_online = Some(trigger);
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the probe loop. Probes once immediately, then every interval.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Connectivity probe started"
        );

        self.probe_once().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Connectivity probe received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.probe_once().await;
                }
            }
        }

        info!("Connectivity probe stopped");
    }

    /// Probe the backend once and update the shared state.
    ///
    /// Returns whether the backend is reachable.
    pub async fn probe_once(&self) -> bool {
        let latency = match self.backend.probe().await {
            Ok(latency) => Some(latency),
            Err(e) => {
                debug!(error = %e, "Connectivity probe failed");
                None
            }
        };

        let online = latency.is_some();
        let changed = self.connectivity.record_probe(latency);

        if changed
            && online
            && let Some(trigger) = &self.on_online
        {
            trigger.notify_one();
        }

        online
    }
}
