// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for attendsync-agent.

use thiserror::Error;

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Local store, outbox or disk operation failed.
    #[error("Core error: {0}")]
    Core(#[from] attendsync_core::CoreError),

    /// Remote backend could not be constructed.
    #[error("Remote backend error: {0}")]
    Remote(#[from] attendsync_core::RemoteError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A required runtime component was not supplied to the builder.
    #[error("{0} is required")]
    MissingComponent(&'static str),
}

/// Result type using the agent Error.
pub type Result<T> = std::result::Result<T, Error>;
