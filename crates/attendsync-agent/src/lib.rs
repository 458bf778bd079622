// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! attendsync agent - the long-running process on each kiosk.
//!
//! This crate hosts the [`attendsync_core`] sync engine: it loads
//! configuration from the environment, recovers from the previous run, spawns
//! the background workers and turns SIGTERM/SIGINT into an ordered shutdown.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Kiosk UI / camera                          │
//! └───────────────────────────────────────────────────────────────────┘
//!                                  │ capture
//!                                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                  attendsync-agent (This Crate)                    │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐             │
//! │  │ Queue drain  │  │ Connectivity │  │ Disk cleanup │  Signal     │
//! │  │   worker     │◄─│    probe     │  │   worker     │  listener   │
//! │  └──────────────┘  └──────────────┘  └──────────────┘             │
//! └───────────────────────────────────────────────────────────────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         attendsync-core                           │
//! │   orchestrator · outbox · store · breakers · disk · shutdown      │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! | Variable | Default |
//! |----------|---------|
//! | `ATTENDSYNC_BACKEND_URL` | required |
//! | `ATTENDSYNC_API_KEY` | required |
//! | `ATTENDSYNC_DATABASE_PATH` | `{data}/attendance.db` |
//! | `ATTENDSYNC_DEVICE_ID` | `kiosk-01` |
//! | `ATTENDSYNC_DATA_DIR` | `.data` |
//! | `ATTENDSYNC_ARTIFACT_DIR` | `{data}/photos` |
//! | `ATTENDSYNC_LOG_DIR` | `{data}/logs` |
//! | `ATTENDSYNC_SYNC_ENABLED` | `true` |
//! | `ATTENDSYNC_SYNC_INTERVAL_SECS` | `60` |
//! | `ATTENDSYNC_SYNC_BATCH_SIZE` | `50` |
//! | `ATTENDSYNC_MAX_RETRIES` | `5` |
//! | `ATTENDSYNC_REQUEST_TIMEOUT_SECS` | `10` |
//! | `ATTENDSYNC_BREAKER_FAILURE_THRESHOLD` | `5` |
//! | `ATTENDSYNC_BREAKER_RESET_TIMEOUT_SECS` | `60` |
//! | `ATTENDSYNC_BREAKER_HALF_OPEN_TRIALS` | `1` |
//! | `ATTENDSYNC_PROBE_INTERVAL_SECS` | `30` |
//! | `ATTENDSYNC_DISK_CRITICAL_PERCENT` | `5` |
//! | `ATTENDSYNC_DISK_WARNING_PERCENT` | `15` |
//! | `ATTENDSYNC_ARTIFACT_RETENTION_DAYS` | `30` |
//! | `ATTENDSYNC_LOG_RETENTION_DAYS` | `7` |
//! | `ATTENDSYNC_MAX_ARTIFACT_MB` | `1024` |
//! | `ATTENDSYNC_CLEANUP_INTERVAL_SECS` | `3600` |
//! | `ATTENDSYNC_SHUTDOWN_TIMEOUT_SECS` | `30` |
//! | `ATTENDSYNC_COMPONENT_TIMEOUT_SECS` | `10` |

#![deny(missing_docs)]

/// Environment-based configuration.
pub mod config;

/// Background probe of backend reachability.
pub mod connectivity_probe;

/// Background disk cleanup.
pub mod disk_cleanup_worker;

/// Error types.
pub mod error;

/// Background outbox drain.
pub mod queue_drain_worker;

/// Runtime wiring and lifecycle.
pub mod runtime;

pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder, AgentStatus};
