// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transactional local store.
//!
//! Wraps the `records` table and the outbox so that a record and its queue
//! entry are created together and retired together. An outbox entry exists
//! for a record exactly when the record is unsynced and in the `pending`
//! state.
//!
//! Every mutation runs in one writer transaction. Dropping a transaction
//! without committing rolls it back, so any `?` between `begin()` and
//! `commit()` leaves the database untouched.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{CoreError, Result};
use crate::model::{NewRecord, OutboxPayload, Record, RecordKind, RecordRow, SyncState};
use crate::outbox::{self, Enqueued, OutboxQueue};

const RECORD_COLUMNS: &str = "id, kind, subject_id, recorded_at, data, artifact_path, device_id, \
                              idempotency_key, synced, remote_id, sync_state, last_error, \
                              synced_at, created_at";

/// Record counts per sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    /// Unsynced and queued.
    pub pending: i64,
    /// Accepted by the backend.
    pub synced: i64,
    /// Dropped after exhausting retries.
    pub abandoned: i64,
}

/// Record table plus outbox, mutated atomically.
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    /// Create a store over an opened database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Outbox handle sharing this store's pools.
    pub fn outbox(&self) -> OutboxQueue {
        OutboxQueue::new(self.db.clone())
    }

    /// Persist a record and its outbox entry in one transaction.
    ///
    /// Returns the local record ID. Any failure, including constraint
    /// violations and trigger aborts, rolls back both inserts.
    pub async fn save_record_with_queue(
        &self,
        record: &NewRecord,
        artifact_path: Option<&str>,
        device_id: &str,
    ) -> Result<i64> {
        let kind = record.kind();
        let data = serde_json::to_string(&record.data)?;
        let idempotency_key = Uuid::new_v4().to_string();

        let mut tx = self.db.writer().begin().await?;

        let record_id = sqlx::query(
            r#"
            INSERT INTO records (kind, subject_id, recorded_at, data, artifact_path, device_id,
                                 idempotency_key, synced, sync_state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'pending', ?)
            "#,
        )
        .bind(kind.as_str())
        .bind(&record.subject_id)
        .bind(record.recorded_at)
        .bind(&data)
        .bind(artifact_path)
        .bind(device_id)
        .bind(&idempotency_key)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::DatabaseError {
            operation: "insert_record".to_string(),
            details: e.to_string(),
        })?
        .last_insert_rowid();

        let payload = OutboxPayload {
            record_id,
            subject_id: record.subject_id.clone(),
            recorded_at: record.recorded_at,
            device_id: device_id.to_string(),
            idempotency_key,
            artifact_path: artifact_path.map(str::to_string),
            data: record.data.clone(),
        };

        let queue_id = outbox::insert_entry(
            &mut tx,
            kind,
            record_id,
            &payload.to_json()?,
            kind.default_priority(),
        )
        .await?;

        tx.commit().await?;

        debug!(
            record_id,
            queue_id,
            kind = %kind,
            subject_id = %record.subject_id,
            "Record saved and queued"
        );

        Ok(record_id)
    }

    /// Mark a record synced and delete its outbox entry in one transaction.
    ///
    /// Returns `false` when the record was already synced by another path.
    pub async fn mark_synced_and_cleanup(&self, record_id: i64, remote_id: &str) -> Result<bool> {
        let mut tx = self.db.writer().begin().await?;

        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE records
            SET synced = 1,
                remote_id = ?,
                sync_state = 'synced',
                synced_at = ?,
                last_error = NULL
            WHERE id = ? AND synced = 0
            RETURNING kind
            "#,
        )
        .bind(remote_id)
        .bind(Utc::now())
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((kind,)) = updated else {
            let exists = record_exists(&mut tx, record_id).await?;
            if !exists {
                return Err(CoreError::RecordNotFound { record_id });
            }
            debug!(record_id, "Record already synced");
            return Ok(false);
        };

        let kind: RecordKind = kind.parse()?;
        outbox::delete_for_record(&mut tx, kind, record_id).await?;
        tx.commit().await?;

        info!(record_id, remote_id, kind = %kind, "Record synced");
        Ok(true)
    }

    /// Flag an unsynced record as abandoned and drop its outbox entry.
    ///
    /// Returns `false` when the record was already synced, in which case
    /// nothing changes.
    pub async fn abandon_and_dequeue(&self, record_id: i64, reason: &str) -> Result<bool> {
        let mut tx = self.db.writer().begin().await?;

        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE records
            SET sync_state = 'abandoned',
                last_error = ?
            WHERE id = ? AND synced = 0
            RETURNING kind
            "#,
        )
        .bind(reason)
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((kind,)) = updated else {
            if !record_exists(&mut tx, record_id).await? {
                return Err(CoreError::RecordNotFound { record_id });
            }
            return Ok(false);
        };

        let kind: RecordKind = kind.parse()?;
        outbox::delete_for_record(&mut tx, kind, record_id).await?;
        tx.commit().await?;

        warn!(record_id, kind = %kind, reason, "Record abandoned");
        Ok(true)
    }

    /// Make sure an unsynced record is `pending` and has an outbox entry.
    ///
    /// Returns `None` for synced records. Abandoned records are moved back to
    /// `pending`.
    pub async fn ensure_queued(&self, record_id: i64) -> Result<Option<Enqueued>> {
        let mut tx = self.db.writer().begin().await?;

        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"
        ))
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CoreError::RecordNotFound { record_id })?;

        let record = Record::try_from(row)?;
        if record.synced {
            return Ok(None);
        }

        if record.sync_state != SyncState::Pending {
            sqlx::query("UPDATE records SET sync_state = 'pending' WHERE id = ?")
                .bind(record_id)
                .execute(&mut *tx)
                .await?;
        }

        let payload = OutboxPayload::from(&record).to_json()?;
        let enqueued = outbox::insert_entry_if_absent(
            &mut tx,
            record.kind,
            record_id,
            &payload,
            record.kind.default_priority(),
        )
        .await?;

        tx.commit().await?;

        if let Enqueued::Created(queue_id) = enqueued {
            info!(
                record_id,
                queue_id,
                previous_state = record.sync_state.as_str(),
                "Record re-queued"
            );
        }

        Ok(Some(enqueued))
    }

    /// Re-create outbox entries for pending records that lost theirs.
    ///
    /// Returns the number of entries created.
    pub async fn repair_missing_queue_entries(&self) -> Result<u64> {
        let orphans: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT r.id
            FROM records r
            LEFT JOIN sync_queue q ON q.record_type = r.kind AND q.record_id = r.id
            WHERE r.synced = 0 AND r.sync_state = 'pending' AND q.queue_id IS NULL
            ORDER BY r.id
            "#,
        )
        .fetch_all(self.db.reader())
        .await?;

        let mut repaired = 0;
        for (record_id,) in orphans {
            if let Some(Enqueued::Created(_)) = self.ensure_queued(record_id).await? {
                repaired += 1;
            }
        }

        if repaired > 0 {
            warn!(repaired, "Re-created missing outbox entries");
        }

        Ok(repaired)
    }

    /// Load one record.
    pub async fn get_record(&self, record_id: i64) -> Result<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"
        ))
        .bind(record_id)
        .fetch_optional(self.db.reader())
        .await?;

        row.map(Record::try_from).transpose()
    }

    /// Unsynced records (pending and abandoned), oldest first.
    pub async fn unsynced_records(&self, limit: i64) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE synced = 0 ORDER BY id ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.db.reader())
        .await?;

        rows.into_iter().map(Record::try_from).collect()
    }

    /// Number of records not yet accepted by the backend.
    pub async fn count_unsynced(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE synced = 0")
            .fetch_one(self.db.reader())
            .await?;

        Ok(count)
    }

    /// Record counts per sync state.
    pub async fn count_by_state(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT sync_state, COUNT(*) FROM records GROUP BY sync_state")
                .fetch_all(self.db.reader())
                .await?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            match state.parse::<SyncState>()? {
                SyncState::Pending => counts.pending = count,
                SyncState::Synced => counts.synced = count,
                SyncState::Abandoned => counts.abandoned = count,
            }
        }

        Ok(counts)
    }

    /// Pending unsynced records grouped by kind tag. Matches
    /// [`OutboxQueue::size_by_type`] whenever the store is consistent.
    pub async fn pending_by_type(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT kind, COUNT(*)
            FROM records
            WHERE synced = 0 AND sync_state = 'pending'
            GROUP BY kind
            ORDER BY kind
            "#,
        )
        .fetch_all(self.db.reader())
        .await?;

        Ok(rows.into_iter().collect())
    }
}

async fn record_exists(conn: &mut SqliteConnection, record_id: i64) -> Result<bool> {
    let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM records WHERE id = ?")
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(found.is_some())
}
