// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable outbox queue.
//!
//! Entries live in the `sync_queue` table and survive restarts. Ordering is
//! `priority ASC, created_at ASC, queue_id ASC`, which is FIFO within a
//! priority band: a low-priority entry is only delayed while higher-priority
//! entries keep arriving.
//!
//! At most one entry exists per `(record_type, record_id)`; the table's
//! unique constraint rejects a second enqueue rather than overwriting.
//!
//! Writes go through the single-writer pool; the crate-internal helpers take
//! a bare connection so [`crate::store::LocalStore`] can call them inside its
//! transactions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::db::Database;
use crate::error::{CoreError, Result};
use crate::model::{OutboxEntry, RecordKind};

const ENTRY_COLUMNS: &str = "queue_id, record_type, record_id, payload, priority, retry_count, \
                             last_error, last_attempt_at, created_at";

/// Result of a guarded enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new entry was created.
    Created(i64),
    /// An entry for the record already existed and was left untouched.
    Existing(i64),
}

impl Enqueued {
    /// Queue ID of the new or existing entry.
    pub fn queue_id(&self) -> i64 {
        match self {
            Enqueued::Created(id) | Enqueued::Existing(id) => *id,
        }
    }
}

/// Handle to the outbox table.
#[derive(Debug, Clone)]
pub struct OutboxQueue {
    db: Database,
}

impl OutboxQueue {
    /// Create a queue handle over an opened database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an entry. Fails with [`CoreError::DuplicateQueueEntry`] if the
    /// record already has one.
    pub async fn enqueue(
        &self,
        record_type: RecordKind,
        record_id: i64,
        payload: &str,
        priority: i64,
    ) -> Result<i64> {
        let mut conn = self.db.writer().acquire().await?;
        insert_entry(&mut conn, record_type, record_id, payload, priority).await
    }

    /// Append an entry unless one already exists for the record.
    pub async fn enqueue_if_absent(
        &self,
        record_type: RecordKind,
        record_id: i64,
        payload: &str,
        priority: i64,
    ) -> Result<Enqueued> {
        let mut conn = self.db.writer().acquire().await?;
        insert_entry_if_absent(&mut conn, record_type, record_id, payload, priority).await
    }

    /// Remove an entry. Removing an absent entry is not an error; the return
    /// value says whether anything was deleted.
    pub async fn dequeue(&self, queue_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE queue_id = ?")
            .bind(queue_id)
            .execute(self.db.writer())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Up to `limit` entries in drain order.
    pub async fn peek_pending(&self, limit: i64) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM sync_queue
            ORDER BY priority ASC, created_at ASC, queue_id ASC
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(self.db.reader())
        .await?;

        Ok(entries)
    }

    /// Record a failed attempt. Returns the new retry count, or `None` if the
    /// entry no longer exists (e.g. another path synced the record).
    pub async fn increment_retry(&self, queue_id: i64, last_error: &str) -> Result<Option<i64>> {
        let retry_count: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1,
                last_error = ?,
                last_attempt_at = ?
            WHERE queue_id = ?
            RETURNING retry_count
            "#,
        )
        .bind(last_error)
        .bind(Utc::now())
        .bind(queue_id)
        .fetch_optional(self.db.writer())
        .await?;

        if let Some((count,)) = retry_count {
            debug!(queue_id, retry_count = count, error = last_error, "Outbox retry recorded");
        }

        Ok(retry_count.map(|(count,)| count))
    }

    /// Look up one entry.
    pub async fn get(&self, queue_id: i64) -> Result<Option<OutboxEntry>> {
        let entry = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE queue_id = ?"
        ))
        .bind(queue_id)
        .fetch_optional(self.db.reader())
        .await?;

        Ok(entry)
    }

    /// Entry owned by a record, if any.
    pub async fn entry_for_record(
        &self,
        record_type: RecordKind,
        record_id: i64,
    ) -> Result<Option<OutboxEntry>> {
        let entry = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE record_type = ? AND record_id = ?"
        ))
        .bind(record_type.as_str())
        .bind(record_id)
        .fetch_optional(self.db.reader())
        .await?;

        Ok(entry)
    }

    /// Total number of pending entries.
    pub async fn size(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(self.db.reader())
            .await?;

        Ok(count)
    }

    /// Pending entries grouped by record type tag.
    pub async fn size_by_type(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT record_type, COUNT(*) FROM sync_queue GROUP BY record_type ORDER BY record_type",
        )
        .fetch_all(self.db.reader())
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Age of the oldest pending entry, `None` when the queue is empty.
    pub async fn oldest_pending_age(&self) -> Result<Option<Duration>> {
        let oldest: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT created_at FROM sync_queue ORDER BY created_at ASC LIMIT 1")
                .fetch_optional(self.db.reader())
                .await?;

        Ok(oldest.map(|(created_at,)| {
            (Utc::now() - created_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        }))
    }
}

pub(crate) async fn insert_entry(
    conn: &mut SqliteConnection,
    record_type: RecordKind,
    record_id: i64,
    payload: &str,
    priority: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_queue (record_type, record_id, payload, priority, retry_count, created_at)
        VALUES (?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(record_type.as_str())
    .bind(record_id)
    .bind(payload)
    .bind(priority)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(CoreError::DuplicateQueueEntry {
                record_type: record_type.as_str().to_string(),
                record_id,
            })
        }
        Err(e) => Err(CoreError::DatabaseError {
            operation: "enqueue".to_string(),
            details: e.to_string(),
        }),
    }
}

pub(crate) async fn insert_entry_if_absent(
    conn: &mut SqliteConnection,
    record_type: RecordKind,
    record_id: i64,
    payload: &str,
    priority: i64,
) -> Result<Enqueued> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_queue (record_type, record_id, payload, priority, retry_count, created_at)
        VALUES (?, ?, ?, ?, 0, ?)
        ON CONFLICT (record_type, record_id) DO NOTHING
        "#,
    )
    .bind(record_type.as_str())
    .bind(record_id)
    .bind(payload)
    .bind(priority)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(Enqueued::Created(result.last_insert_rowid()));
    }

    let (queue_id,): (i64,) =
        sqlx::query_as("SELECT queue_id FROM sync_queue WHERE record_type = ? AND record_id = ?")
            .bind(record_type.as_str())
            .bind(record_id)
            .fetch_one(&mut *conn)
            .await?;

    Ok(Enqueued::Existing(queue_id))
}

pub(crate) async fn delete_for_record(
    conn: &mut SqliteConnection,
    record_type: RecordKind,
    record_id: i64,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sync_queue WHERE record_type = ? AND record_id = ?")
        .bind(record_type.as_str())
        .bind(record_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}
