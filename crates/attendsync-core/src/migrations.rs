// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for attendsync-core.
//!
//! The schema is embedded at compile time. [`crate::db::Database::open`] runs
//! these automatically; embedders that manage their own pool can call
//! [`run_sqlite`] directly.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use attendsync_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:.data/attendance.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with the records and outbox schema embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
