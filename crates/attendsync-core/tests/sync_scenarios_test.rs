// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end outbox scenarios against a scripted backend.

mod common;

use std::time::Duration;

use attendsync_core::circuit_breaker::{BreakerConfig, BreakerState};
use attendsync_core::model::{AttendanceStatus, NewRecord, RecordData, RecordKind, SyncState};
use attendsync_core::sync::{BatchReport, Endpoint, SyncConfig, SyncOutcome};
use common::{ScriptedBackend, TestContext, permanent, transient};
use tempfile::TempDir;

fn config(failure_threshold: u32, max_retries: i64) -> SyncConfig {
    SyncConfig {
        max_retries,
        breaker: BreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_secs(60),
            half_open_trials: 1,
        },
        ..SyncConfig::default()
    }
}

#[tokio::test]
async fn test_student_record_syncs_with_remote_id() {
    let ctx = TestContext::new(ScriptedBackend::accepting("555"), SyncConfig::default()).await;
    let record_id = ctx.save_student("2021001", "Ana Reyes").await;

    let report = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(
        report,
        BatchReport {
            processed: 1,
            succeeded: 1,
            ..BatchReport::default()
        }
    );

    let record = ctx.store.get_record(record_id).await.unwrap().unwrap();
    assert!(record.synced);
    assert_eq!(record.remote_id.as_deref(), Some("555"));
    assert_eq!(record.sync_state, SyncState::Synced);
    assert_eq!(ctx.store.outbox().size().await.unwrap(), 0);

    let bodies = ctx.backend.bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0].0, "students");
    assert_eq!(bodies[0].1.subject_id, "2021001");
    assert_eq!(bodies[0].1.idempotency_key, record.idempotency_key);
    assert_eq!(bodies[0].1.local_id, record_id);
}

#[tokio::test]
async fn test_open_breaker_defers_without_spending_retries() {
    let ctx = TestContext::new(ScriptedBackend::failing(transient()), config(3, 5)).await;
    let record_id = ctx.save_attendance("2021001").await;

    for attempt in 1..=3 {
        let report = ctx.orchestrator.process_queue(10).await.unwrap();
        assert_eq!(report.failed, 1, "attempt {attempt}");
    }
    assert_eq!(
        ctx.orchestrator.breaker(Endpoint::Attendance).state(),
        BreakerState::Open
    );

    let report = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(ctx.backend.insert_calls(), 3);

    let entry = ctx
        .store
        .outbox()
        .entry_for_record(RecordKind::Attendance, record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.retry_count, 3);
    ctx.assert_consistent().await;
}

#[tokio::test]
async fn test_retry_ceiling_abandons_after_exact_attempts() {
    let ctx = TestContext::new(ScriptedBackend::failing(permanent()), config(100, 3)).await;
    let record_id = ctx.save_attendance("2021001").await;

    let first = ctx.orchestrator.process_queue(10).await.unwrap();
    let second = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!((first.failed, first.abandoned), (1, 0));
    assert_eq!((second.failed, second.abandoned), (1, 0));

    let third = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(third.failed, 1);
    assert_eq!(third.abandoned, 1);

    let fourth = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(fourth.processed, 0);
    assert_eq!(ctx.backend.insert_calls(), 3);

    let record = ctx.store.get_record(record_id).await.unwrap().unwrap();
    assert!(!record.synced);
    assert_eq!(record.sync_state, SyncState::Abandoned);
    assert!(record.last_error.unwrap().contains("422"));

    let status = ctx.orchestrator.get_status().await.unwrap();
    assert_eq!(status.abandoned_count, 1);
    assert_eq!(status.unsynced_count, 1);
    assert_eq!(status.queue_size, 0);
    ctx.assert_consistent().await;
}

#[tokio::test]
async fn test_permanent_rejection_does_not_trip_breaker() {
    let ctx = TestContext::new(ScriptedBackend::failing(permanent()), config(1, 5)).await;
    ctx.save_attendance("2021001").await;
    ctx.save_attendance("2021002").await;

    let report = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.deferred, 0);
    assert_eq!(
        ctx.orchestrator.breaker(Endpoint::Attendance).state(),
        BreakerState::Closed
    );
}

#[tokio::test]
async fn test_entry_already_at_ceiling_is_abandoned_without_attempt() {
    let ctx = TestContext::new(ScriptedBackend::accepting("1"), config(5, 2)).await;
    let record_id = ctx.save_attendance("2021001").await;
    sqlx::query("UPDATE sync_queue SET retry_count = 2 WHERE record_id = ?")
        .bind(record_id)
        .execute(ctx.store.database().writer())
        .await
        .unwrap();

    let report = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(ctx.backend.insert_calls(), 0);
}

#[tokio::test]
async fn test_students_drain_before_attendance() {
    let ctx = TestContext::new(ScriptedBackend::accepting("9"), SyncConfig::default()).await;
    ctx.save_attendance("2021001").await;
    ctx.save_attendance("2021002").await;
    ctx.save_student("2021001", "Ana Reyes").await;

    ctx.orchestrator.process_queue(10).await.unwrap();

    let resources: Vec<String> = ctx.backend.bodies().into_iter().map(|(r, _)| r).collect();
    assert_eq!(resources, vec!["students", "attendance", "attendance"]);
    let subjects: Vec<String> = ctx
        .backend
        .bodies()
        .into_iter()
        .skip(1)
        .map(|(_, b)| b.subject_id)
        .collect();
    assert_eq!(subjects, vec!["2021001", "2021002"]);
}

#[tokio::test]
async fn test_batch_size_limits_work() {
    let ctx = TestContext::new(ScriptedBackend::accepting("9"), SyncConfig::default()).await;
    for i in 0..5 {
        ctx.save_attendance(&format!("20210{i:02}")).await;
    }

    let report = ctx.orchestrator.process_queue(2).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(ctx.store.outbox().size().await.unwrap(), 3);
    ctx.assert_consistent().await;
}

#[tokio::test]
async fn test_force_sync_all_requeues_abandoned_records() {
    let ctx = TestContext::new(ScriptedBackend::failing(permanent()), config(100, 1)).await;
    let record_id = ctx.save_attendance("2021001").await;

    let report = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(report.abandoned, 1);

    ctx.backend.set_default(Ok("777".to_string()));
    let report = ctx.orchestrator.force_sync_all().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let record = ctx.store.get_record(record_id).await.unwrap().unwrap();
    assert!(record.synced);
    assert_eq!(record.remote_id.as_deref(), Some("777"));
    assert_eq!(ctx.orchestrator.get_status().await.unwrap().abandoned_count, 0);
}

#[tokio::test]
async fn test_force_sync_all_repairs_missing_entries() {
    let ctx = TestContext::new(ScriptedBackend::accepting("5"), SyncConfig::default()).await;
    let record_id = ctx.save_attendance("2021001").await;
    sqlx::query("DELETE FROM sync_queue")
        .execute(ctx.store.database().writer())
        .await
        .unwrap();

    let report = ctx.orchestrator.force_sync_all().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(ctx.store.get_record(record_id).await.unwrap().unwrap().synced);
}

#[tokio::test]
async fn test_force_sync_all_gives_up_when_offline() {
    let config = SyncConfig {
        online_wait: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let ctx = TestContext::new(ScriptedBackend::accepting("5"), config).await;
    ctx.connectivity.set_online(false);
    ctx.save_attendance("2021001").await;

    let report = ctx.orchestrator.force_sync_all().await.unwrap();
    assert_eq!(report, BatchReport::default());
    assert_eq!(ctx.backend.insert_calls(), 0);
}

#[tokio::test]
async fn test_artifact_url_attached_to_record() {
    let temp = TempDir::new().unwrap();
    let photo = temp.path().join("2021001.jpg");
    std::fs::write(&photo, b"jpeg").unwrap();

    let ctx = TestContext::new(ScriptedBackend::accepting("42"), SyncConfig::default()).await;
    ctx.backend
        .set_upload(Ok("https://cdn.example/abc.jpg".to_string()));
    let record_id = ctx
        .store
        .save_record_with_queue(
            &NewRecord::attendance("2021001", AttendanceStatus::Late),
            Some(photo.to_str().unwrap()),
            "kiosk-test",
        )
        .await
        .unwrap();

    let record = ctx.store.get_record(record_id).await.unwrap().unwrap();
    let outcome = ctx.orchestrator.sync_one(&record).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced("42".to_string()));

    let (_, body) = ctx.backend.bodies().remove(0);
    assert_eq!(body.artifact_url.as_deref(), Some("https://cdn.example/abc.jpg"));
    assert!(matches!(
        body.data,
        RecordData::Attendance {
            status: AttendanceStatus::Late,
            ..
        }
    ));
}

#[tokio::test]
async fn test_artifact_failure_does_not_block_record() {
    let temp = TempDir::new().unwrap();
    let photo = temp.path().join("2021001.jpg");
    std::fs::write(&photo, b"jpeg").unwrap();

    let ctx = TestContext::new(ScriptedBackend::accepting("43"), SyncConfig::default()).await;
    ctx.backend.set_upload(Err(common::transient()));
    ctx.store
        .save_record_with_queue(
            &NewRecord::attendance("2021001", AttendanceStatus::Present),
            Some(photo.to_str().unwrap()),
            "kiosk-test",
        )
        .await
        .unwrap();
    ctx.store
        .save_record_with_queue(
            &NewRecord::attendance("2021002", AttendanceStatus::Present),
            Some(temp.path().join("missing.jpg").to_str().unwrap()),
            "kiosk-test",
        )
        .await
        .unwrap();

    let report = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(ctx.backend.upload_calls(), 1);
    assert!(ctx.backend.bodies().iter().all(|(_, b)| b.artifact_url.is_none()));
}

#[tokio::test]
async fn test_sync_one_queues_when_breaker_open() {
    let ctx = TestContext::new(ScriptedBackend::failing(transient()), config(1, 5)).await;
    let first = ctx.save_attendance("2021001").await;
    let second = ctx.save_attendance("2021002").await;

    let record = ctx.store.get_record(first).await.unwrap().unwrap();
    assert!(matches!(
        ctx.orchestrator.sync_one(&record).await.unwrap(),
        SyncOutcome::Failed(_)
    ));

    let record = ctx.store.get_record(second).await.unwrap().unwrap();
    assert_eq!(
        ctx.orchestrator.sync_one(&record).await.unwrap(),
        SyncOutcome::Queued
    );
    assert_eq!(ctx.backend.insert_calls(), 1);

    ctx.orchestrator.reset_breakers();
    ctx.backend.set_default(Ok("1".to_string()));
    let report = ctx.orchestrator.process_queue(10).await.unwrap();
    assert_eq!(report.succeeded, 2);
    ctx.assert_consistent().await;
}

#[tokio::test]
async fn test_consistency_holds_across_mixed_outcomes() {
    let ctx = TestContext::new(ScriptedBackend::accepting("1"), config(100, 2)).await;
    ctx.save_student("2021001", "Ana Reyes").await;
    ctx.save_attendance("2021001").await;
    ctx.save_attendance("2021002").await;
    ctx.save_attendance("2021003").await;

    ctx.backend.push(Ok("s-1".to_string()));
    ctx.backend.push(Err(permanent()));
    ctx.backend.push(Err(transient()));
    ctx.backend.push(Ok("a-3".to_string()));

    ctx.orchestrator.process_queue(10).await.unwrap();
    ctx.assert_consistent().await;

    let counts = ctx.store.count_by_state().await.unwrap();
    assert_eq!(counts.synced, 2);
    assert_eq!(counts.pending, 2);
    assert_eq!(ctx.store.outbox().size().await.unwrap(), 2);
}
