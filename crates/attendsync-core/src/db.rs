// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite connection management.
//!
//! SQLite allows one writer at a time. Rather than letting several pooled
//! connections race for the write lock (and fail deferred transactions with
//! `SQLITE_BUSY`), all mutations go through a dedicated single-connection
//! writer pool while reads use a separate pool in WAL mode.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::migrations;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Writer/reader pool pair backing the local store.
#[derive(Debug, Clone)]
pub struct Database {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and run migrations.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Enables WAL, `synchronous=NORMAL`, foreign keys and a busy timeout
    /// - Runs all migrations on the writer before the reader pool is opened
    pub async fn open(path: impl AsRef<Path>, reader_connections: u32) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let base = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base.clone().create_if_missing(true))
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open SQLite writer at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(reader_connections.max(1))
            .connect_with(base.read_only(true))
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open SQLite reader at {:?}: {}", path, e),
            })?;

        info!(path = %path.display(), reader_connections, "Local database opened");

        Ok(Self { writer, reader })
    }

    /// Create a migrated in-memory database.
    ///
    /// An in-memory SQLite database lives and dies with its connection, so a
    /// single never-recycled connection serves both roles.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        migrations::run_sqlite(&pool).await?;
        debug!("In-memory database created");

        Ok(Self::from_pool(pool))
    }

    /// Use one existing (already migrated) pool for both reads and writes.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            writer: pool.clone(),
            reader: pool,
        }
    }

    /// Pool that owns the single write connection.
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    /// Pool used for read-only queries.
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// Verify both pools can execute a trivial query.
    pub async fn health_check(&self) -> Result<bool> {
        let (w,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.writer).await?;
        let (r,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.reader).await?;
        Ok(w == 1 && r == 1)
    }

    /// Close both pools, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
        info!("Local database closed");
    }
}
