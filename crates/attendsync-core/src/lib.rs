// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Attendsync Core - Offline-First Sync Engine
//!
//! This crate keeps an attendance kiosk's captured records safe on local
//! storage and delivers them to a remote backend whenever the network allows,
//! without ever blocking capture of the next event.
//!
//! # Architecture
//!
//! ```text
//!   capture pipeline
//!          │ NewRecord + photo
//!          ▼
//! ┌──────────────────┐  refuse when draining   ┌──────────────────────┐
//! │  CaptureService  │◄────────────────────────│ ShutdownCoordinator  │
//! │                  │  refuse when disk full  ├──────────────────────┤
//! │                  │◄────────────────────────│ DiskMonitor          │
//! └──────────────────┘                         └──────────────────────┘
//!          │ one transaction
//!          ▼
//! ┌──────────────────┐      ┌──────────────────┐
//! │   LocalStore     │─────▶│   OutboxQueue    │  records + sync_queue
//! │   (records)      │      │   (sync_queue)   │  in SQLite (WAL)
//! └──────────────────┘      └──────────────────┘
//!          ▲                         │ peek_pending
//!          │ mark synced + dequeue   ▼
//! ┌─────────────────────────────────────────────┐
//! │              SyncOrchestrator               │
//! │  breaker: attendance │ students │ artifacts │
//! └─────────────────────────────────────────────┘
//!                        │ RemoteBackend (REST)
//!                        ▼
//!                  remote backend
//! ```
//!
//! # Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | No lost captures | record and outbox entry are inserted in one transaction |
//! | At-least-once delivery | entries leave the outbox only in the transaction that marks the record synced |
//! | Idempotent retries | each record carries a client-generated `idempotency_key` sent with every write |
//! | Bounded retries | entries reaching `max_retries` are abandoned and logged with their payload |
//! | Failure isolation | one circuit breaker per remote endpoint |
//! | Storage safety | captures are refused when free space is critical |
//!
//! # Record Lifecycle
//!
//! ```text
//!            save_record_with_queue
//!                     │
//!                     ▼
//!  ┌──────────┐  delivered   ┌──────────┐
//!  │ PENDING  │─────────────▶│  SYNCED  │
//!  └──────────┘              └──────────┘
//!     │    ▲
//!     │    │ force_sync_all / ensure_queued
//!     ▼    │
//!  ┌───────────┐
//!  │ ABANDONED │  retry ceiling reached or payload undecodable
//!  └───────────┘
//! ```
//!
//! # Modules
//!
//! - [`capture`]: admission of newly captured records
//! - [`circuit_breaker`]: per-endpoint failure isolation
//! - [`connectivity`]: shared online/offline belief
//! - [`db`]: SQLite writer/reader pools
//! - [`disk`]: disk usage and space reclamation
//! - [`error`]: error types with stable codes
//! - [`migrations`]: embedded schema
//! - [`model`]: record and outbox types
//! - [`outbox`]: the durable queue
//! - [`remote`]: backend client
//! - [`shutdown`]: ordered, time-bounded teardown
//! - [`store`]: transactional record store
//! - [`sync`]: the orchestrator

#![deny(missing_docs)]

/// Capture admission: backpressure, artifact write, save, first sync.
pub mod capture;

/// Circuit breaker with generation-stamped permits.
pub mod circuit_breaker;

/// Watch-channel backed connectivity flag.
pub mod connectivity;

/// SQLite connection management.
pub mod db;

/// Disk-space monitor and cleanup.
pub mod disk;

/// Error types for core operations.
pub mod error;

/// Embedded SQLite migrations.
pub mod migrations;

/// Records, kinds and outbox entries.
pub mod model;

/// Durable outbox queue.
pub mod outbox;

/// REST backend client and the backend trait.
pub mod remote;

/// Graceful shutdown coordinator and marker file.
pub mod shutdown;

/// Transactional local store.
pub mod store;

/// Sync orchestrator.
pub mod sync;

pub use capture::{Artifact, CaptureConfig, CaptureReceipt, CaptureService};
pub use circuit_breaker::{BreakerConfig, BreakerError, BreakerState, BreakerStatus, CircuitBreaker};
pub use connectivity::ConnectivityState;
pub use db::Database;
pub use disk::{CleanupReport, DiskConfig, DiskLevel, DiskMonitor, DiskStatus, DiskUsage};
pub use error::{CoreError, Result};
pub use model::{AttendanceStatus, NewRecord, OutboxEntry, Record, RecordData, RecordKind, SyncState};
pub use outbox::{Enqueued, OutboxQueue};
pub use remote::{HttpBackend, HttpBackendConfig, RemoteBackend, RemoteError, RemoteRecord};
pub use shutdown::{ShutdownConfig, ShutdownCoordinator, ShutdownMarker, ShutdownPhase};
pub use store::{LocalStore, StateCounts};
pub use sync::{BatchReport, Endpoint, SyncConfig, SyncOrchestrator, SyncOutcome, SyncStatus};
