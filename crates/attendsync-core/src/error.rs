// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for attendsync-core.
//!
//! Local storage failures are always fatal to the operation that hit them and
//! are propagated to the caller. Network failures live in
//! [`crate::remote::RemoteError`] and never surface through this type on the
//! capture path.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the local store, outbox, disk monitor and capture path.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Record was not found in the local store.
    #[error("Record {record_id} not found")]
    RecordNotFound {
        /// The local record ID that was not found.
        record_id: i64,
    },

    /// An outbox entry already exists for this record.
    #[error("Outbox entry already exists for {record_type} record {record_id}")]
    DuplicateQueueEntry {
        /// Record kind tag.
        record_type: String,
        /// Local record ID.
        record_id: i64,
    },

    /// Not enough free disk space to accept a new write.
    #[error("Insufficient disk space: {required_mb} MB required, {free_mb} MB free")]
    InsufficientDiskSpace {
        /// Space requested by the caller, in MB.
        required_mb: u64,
        /// Space currently available, in MB.
        free_mb: u64,
    },

    /// The process is draining and no longer admits new captures.
    #[error("Shutdown in progress, new captures are not accepted")]
    ShuttingDown,

    /// Stored payload could not be decoded or input failed validation.
    #[error("Invalid payload for '{field}': {message}")]
    InvalidPayload {
        /// The field or column that failed.
        field: String,
        /// What went wrong.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Filesystem operation failed.
    #[error("IO error during '{operation}': {details}")]
    IoError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            Self::DuplicateQueueEntry { .. } => "DUPLICATE_QUEUE_ENTRY",
            Self::InsufficientDiskSpace { .. } => "INSUFFICIENT_DISK_SPACE",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::IoError { .. } => "IO_ERROR",
        }
    }

    pub(crate) fn io(operation: &str, err: std::io::Error) -> Self {
        CoreError::IoError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidPayload {
            field: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::io("io", err)
    }
}
