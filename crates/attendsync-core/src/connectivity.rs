// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared belief about backend reachability.
//!
//! Backed by a `watch` channel so workers can await the offline to online
//! transition instead of polling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Latest connectivity observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Connectivity {
    /// Whether the backend is believed reachable.
    pub online: bool,
    /// Round-trip time of the last successful probe.
    pub latency: Option<Duration>,
    /// When the last probe finished.
    pub checked_at: Option<DateTime<Utc>>,
}

/// Cloneable handle to the connectivity flag.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityState {
    /// Create the state with an initial belief.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(Connectivity {
            online,
            latency: None,
            checked_at: None,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot.
    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Whether the backend is believed reachable.
    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    /// Latency of the last successful probe.
    pub fn latency(&self) -> Option<Duration> {
        self.tx.borrow().latency
    }

    /// Override the flag. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|c| {
            let changed = c.online != online;
            c.online = online;
            changed
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    /// Record a probe outcome. Returns `true` if the online flag changed.
    pub fn record_probe(&self, latency: Option<Duration>) -> bool {
        let online = latency.is_some();
        let mut changed = false;
        self.tx.send_modify(|c| {
            changed = c.online != online;
            c.online = online;
            if latency.is_some() {
                c.latency = latency;
            }
            c.checked_at = Some(Utc::now());
        });
        if changed {
            info!(
                online,
                latency_ms = latency.map(|l| l.as_millis() as u64),
                "Connectivity changed"
            );
        }
        changed
    }

    /// Receiver that observes every update.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Wait until online or until `timeout` passes. Returns the final belief.
    pub async fn wait_online(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|c| c.online)).await {
            Ok(Ok(_)) => true,
            _ => self.is_online(),
        }
    }
}
