// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for attendsync-agent integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use attendsync_agent::connectivity_probe::ConnectivityProbeConfig;
use attendsync_agent::disk_cleanup_worker::DiskCleanupWorkerConfig;
use attendsync_agent::queue_drain_worker::QueueDrainWorkerConfig;
use attendsync_agent::runtime::{AgentRuntime, AgentRuntimeBuilder};
use attendsync_core::capture::CaptureConfig;
use attendsync_core::remote::{RemoteBackend, RemoteError, RemoteRecord};
use attendsync_core::shutdown::ShutdownConfig;
use attendsync_core::DiskConfig;

/// Backend that is either reachable (accepting everything) or not.
pub struct StubBackend {
    reachable: AtomicBool,
    next_id: AtomicU32,
    insert_calls: AtomicU32,
    probe_calls: AtomicU32,
    stall_next: AtomicBool,
    stalled: AtomicU32,
}

/// Counts a stalled insert for as long as its future is alive.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubBackend {
    pub fn reachable() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            next_id: AtomicU32::new(100),
            insert_calls: AtomicU32::new(0),
            probe_calls: AtomicU32::new(0),
            stall_next: AtomicBool::new(false),
            stalled: AtomicU32::new(0),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        let backend = Self::reachable();
        backend.set_reachable(false);
        backend
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> u32 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Make the next insert hang for a minute.
    pub fn stall_next_insert(&self) {
        self.stall_next.store(true, Ordering::SeqCst);
    }

    /// Inserts currently hanging and not yet dropped.
    pub fn stalled_inserts(&self) -> u32 {
        self.stalled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Connect("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl RemoteBackend for StubBackend {
    async fn insert_record(&self, _resource: &str, _record: &RemoteRecord) -> Result<String, RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_next.swap(false, Ordering::SeqCst) {
            self.stalled.fetch_add(1, Ordering::SeqCst);
            let _in_flight = InFlight(&self.stalled);
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.check()?;
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn upload_artifact(&self, object: &str, _bytes: Vec<u8>) -> Result<String, RemoteError> {
        self.check()?;
        Ok(format!("https://cdn.test/artifacts/{object}"))
    }

    async fn probe(&self) -> Result<Duration, RemoteError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(Duration::from_millis(5))
    }
}

/// Disk settings rooted in `root` that never report the disk as critical.
pub fn disk_config(root: &Path) -> DiskConfig {
    DiskConfig {
        data_dir: root.to_path_buf(),
        artifact_dir: root.join("photos"),
        log_dir: root.join("logs"),
        critical_free_percent: 0.0,
        warning_free_percent: 0.0,
        ..DiskConfig::default()
    }
}

pub fn marker_path(temp: &TempDir) -> std::path::PathBuf {
    temp.path().join("shutdown_marker.json")
}

/// Builder with every path inside `temp`, no signal handlers and workers
/// that only act when triggered.
pub fn builder(temp: &TempDir, backend: Arc<StubBackend>) -> AgentRuntimeBuilder {
    let idle = Duration::from_secs(3600);
    AgentRuntime::builder()
        .backend(backend)
        .database_path(temp.path().join("attendance.db"))
        .device_id("kiosk-test")
        .disk_config(disk_config(temp.path()))
        .capture_config(CaptureConfig {
            artifact_dir: temp.path().join("photos"),
            required_free_mb: 0,
        })
        .shutdown_config(ShutdownConfig {
            overall_timeout: Duration::from_secs(10),
            component_timeout: Duration::from_secs(5),
            marker_path: Some(marker_path(temp)),
        })
        .queue_drain_config(QueueDrainWorkerConfig {
            poll_interval: idle,
            ..QueueDrainWorkerConfig::default()
        })
        .probe_config(ConnectivityProbeConfig {
            poll_interval: idle,
        })
        .disk_cleanup_config(DiskCleanupWorkerConfig {
            poll_interval: idle,
        })
        .handle_signals(false)
}

pub async fn start(temp: &TempDir, backend: Arc<StubBackend>) -> AgentRuntime {
    builder(temp, backend).build().unwrap().start().await.unwrap()
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
