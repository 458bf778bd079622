// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AgentRuntime lifecycle: startup recovery, capture, shutdown and restart.

mod common;

use std::time::Duration;

use tempfile::TempDir;

use attendsync_agent::Error;
use attendsync_agent::runtime::AgentRuntime;
use attendsync_core::capture::Artifact;
use attendsync_core::shutdown::{ComponentOutcome, ShutdownConfig, ShutdownPhase, read_marker};
use attendsync_core::sync::SyncOutcome;
use attendsync_core::{AttendanceStatus, CoreError, Database, LocalStore, NewRecord, RecordKind};
use common::StubBackend;

#[test]
fn test_build_requires_backend() {
    match AgentRuntime::builder().build() {
        Err(Error::MissingComponent(name)) => assert_eq!(name, "backend"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("build should fail without a backend"),
    }
}

#[tokio::test]
async fn test_capture_syncs_immediately_when_online() {
    let temp = TempDir::new().unwrap();
    let backend = StubBackend::reachable();
    let runtime = common::start(&temp, backend.clone()).await;

    let receipt = runtime
        .capture(
            NewRecord::attendance("2021001", AttendanceStatus::Present),
            Some(Artifact::jpeg(vec![0xFF, 0xD8, 0xFF, 0xE0])),
        )
        .await
        .unwrap();

    assert!(matches!(receipt.sync, SyncOutcome::Synced(_)));
    let record = runtime
        .orchestrator()
        .store()
        .get_record(receipt.record_id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.synced);
    assert_eq!(record.device_id, "kiosk-test");
    assert!(record.artifact_path.is_some());
    assert_eq!(runtime.orchestrator().store().outbox().size().await.unwrap(), 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_capture_while_offline_stays_queued() {
    let temp = TempDir::new().unwrap();
    let backend = StubBackend::unreachable();
    let runtime = common::start(&temp, backend.clone()).await;

    let receipt = runtime
        .capture(NewRecord::student("2021001", "Ana Reyes"), None)
        .await
        .unwrap();

    assert!(!matches!(receipt.sync, SyncOutcome::Synced(_)));
    let store = runtime.orchestrator().store();
    assert_eq!(store.count_unsynced().await.unwrap(), 1);
    assert!(
        store
            .outbox()
            .entry_for_record(RecordKind::Student, receipt.record_id)
            .await
            .unwrap()
            .is_some()
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_runs_teardowns_in_order_and_closes_admission() {
    let temp = TempDir::new().unwrap();
    let runtime = common::start(&temp, StubBackend::reachable()).await;
    assert!(runtime.is_running());

    let marker = runtime.shutdown().await.unwrap();

    assert!(marker.clean_shutdown);
    let names: Vec<_> = marker.components.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "connectivity_probe",
            "disk_cleanup_worker",
            "queue_drain_worker",
            "sync_flush",
            "database",
        ]
    );
    assert!(!runtime.is_running());
    assert_eq!(runtime.coordinator().phase(), ShutdownPhase::Stopped);

    let on_disk = read_marker(&common::marker_path(&temp)).await.unwrap().unwrap();
    assert_eq!(on_disk, marker);

    let refused = runtime
        .capture(NewRecord::attendance("2021001", AttendanceStatus::Late), None)
        .await;
    assert!(matches!(refused, Err(CoreError::ShuttingDown)));

    assert!(runtime.shutdown().await.is_none());
    runtime.wait().await;
}

#[tokio::test]
async fn test_restart_recovers_marker_and_delivers_backlog() {
    let temp = TempDir::new().unwrap();
    let backend = StubBackend::unreachable();

    let record_id = {
        let runtime = common::start(&temp, backend.clone()).await;
        assert!(runtime.previous_marker().is_none());
        let receipt = runtime
            .capture(NewRecord::attendance("2021001", AttendanceStatus::Present), None)
            .await
            .unwrap();
        runtime.shutdown().await.unwrap();
        receipt.record_id
    };

    backend.set_reachable(true);
    let runtime = common::start(&temp, backend.clone()).await;

    let previous = runtime.previous_marker().unwrap();
    assert!(previous.clean_shutdown);
    assert!(!common::marker_path(&temp).exists());

    let report = runtime.force_sync().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let record = runtime
        .orchestrator()
        .store()
        .get_record(record_id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.synced);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_startup_repairs_missing_outbox_entries() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("attendance.db");

    {
        let db = Database::open(&path, 1).await.unwrap();
        let store = LocalStore::new(db.clone());
        let id = store
            .save_record_with_queue(
                &NewRecord::attendance("2021001", AttendanceStatus::Absent),
                None,
                "kiosk-test",
            )
            .await
            .unwrap();
        let entry = store
            .outbox()
            .entry_for_record(RecordKind::Attendance, id)
            .await
            .unwrap()
            .unwrap();
        assert!(store.outbox().dequeue(entry.queue_id).await.unwrap());
        db.close().await;
    }

    let runtime = common::start(&temp, StubBackend::unreachable()).await;

    assert_eq!(runtime.repaired_entries(), 1);
    assert_eq!(runtime.orchestrator().store().outbox().size().await.unwrap(), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_reports_queue_and_phase() {
    let temp = TempDir::new().unwrap();
    let runtime = common::start(&temp, StubBackend::unreachable()).await;

    runtime
        .capture(NewRecord::attendance("2021001", AttendanceStatus::Present), None)
        .await
        .unwrap();
    runtime
        .capture(NewRecord::student("2021002", "Ben Okafor"), None)
        .await
        .unwrap();

    let status = runtime.status().await.unwrap();
    assert_eq!(status.phase, ShutdownPhase::Running);
    assert_eq!(status.sync.queue_size, 2);
    assert_eq!(status.sync.unsynced_count, 2);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["phase"], "running");
    assert!(json["disk"]["level"].is_string());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sync_now_drains_backlog_after_reconnect() {
    let temp = TempDir::new().unwrap();
    let backend = StubBackend::unreachable();
    let runtime = common::start(&temp, backend.clone()).await;

    runtime
        .capture(NewRecord::attendance("2021001", AttendanceStatus::Present), None)
        .await
        .unwrap();

    backend.set_reachable(true);
    runtime.orchestrator().connectivity().set_online(true);
    runtime.orchestrator().reset_breakers();
    runtime.sync_now();

    let store = runtime.orchestrator().store().clone();
    assert!(
        common::eventually(|| {
            let store = store.clone();
            async move { store.count_unsynced().await.unwrap() == 0 }
        })
        .await
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stuck_drain_worker_is_stopped_before_database_closes() {
    let temp = TempDir::new().unwrap();
    let backend = StubBackend::reachable();
    let runtime = common::builder(&temp, backend.clone())
        .shutdown_config(ShutdownConfig {
            overall_timeout: Duration::from_secs(10),
            component_timeout: Duration::from_millis(300),
            marker_path: Some(common::marker_path(&temp)),
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    backend.stall_next_insert();
    runtime
        .orchestrator()
        .store()
        .save_record_with_queue(
            &NewRecord::attendance("2021001", AttendanceStatus::Present),
            None,
            "kiosk-test",
        )
        .await
        .unwrap();
    runtime.sync_now();
    assert!(
        common::eventually(|| {
            let backend = backend.clone();
            async move { backend.stalled_inserts() == 1 }
        })
        .await
    );

    let marker = runtime.shutdown().await.unwrap();

    let outcome_of = |name: &str| {
        marker
            .components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.outcome.clone())
            .unwrap()
    };
    assert_eq!(outcome_of("queue_drain_worker"), ComponentOutcome::TimedOut);
    assert_eq!(outcome_of("database"), ComponentOutcome::Completed);
    assert_eq!(marker.components.last().unwrap().name, "database");

    // The hung insert belongs to the aborted worker and must not outlive it.
    assert!(
        common::eventually(|| {
            let backend = backend.clone();
            async move { backend.stalled_inserts() == 0 }
        })
        .await
    );
}
