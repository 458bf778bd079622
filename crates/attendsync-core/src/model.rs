// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record and outbox types shared by the store, the queue and the orchestrator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The closed set of record kinds this device produces.
///
/// The serialized tag is what the outbox stores in `record_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A check-in event for a student.
    Attendance,
    /// A student enrolled at the kiosk.
    Student,
}

impl RecordKind {
    /// All kinds, in priority order.
    pub const ALL: [RecordKind; 2] = [RecordKind::Student, RecordKind::Attendance];

    /// Tag stored in `records.kind` and `sync_queue.record_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Attendance => "attendance",
            RecordKind::Student => "student",
        }
    }

    /// REST resource the kind is written to.
    pub fn resource(&self) -> &'static str {
        match self {
            RecordKind::Attendance => "attendance",
            RecordKind::Student => "students",
        }
    }

    /// Queue priority (lower drains first). Students go before attendance so
    /// the backend knows a subject before its check-ins arrive.
    pub fn default_priority(&self) -> i64 {
        match self {
            RecordKind::Student => 0,
            RecordKind::Attendance => 1,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attendance" => Ok(RecordKind::Attendance),
            "student" => Ok(RecordKind::Student),
            other => Err(CoreError::InvalidPayload {
                field: "record_type".to_string(),
                message: format!("unknown record kind '{}'", other),
            }),
        }
    }
}

/// Attendance outcome recorded by the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    /// Arrived on time.
    Present,
    /// Arrived after the grace period.
    Late,
    /// Marked absent.
    Absent,
}

/// Kind-specific record data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordData {
    /// Attendance event.
    Attendance {
        /// Outcome of the check-in.
        status: AttendanceStatus,
        /// Session or class label, if the schedule collaborator supplied one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    /// Student registration.
    Student {
        /// Display name.
        full_name: String,
        /// Course or program.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        course: Option<String>,
        /// Section or block.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section: Option<String>,
    },
}

impl RecordData {
    /// Kind this data belongs to.
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordData::Attendance { .. } => RecordKind::Attendance,
            RecordData::Student { .. } => RecordKind::Student,
        }
    }
}

/// Local sync lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Waiting in the outbox.
    Pending,
    /// Accepted by the backend.
    Synced,
    /// Dropped from the outbox after exhausting its retries.
    Abandoned,
}

impl SyncState {
    /// Value stored in `records.sync_state`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Abandoned => "abandoned",
        }
    }
}

impl FromStr for SyncState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            "abandoned" => Ok(SyncState::Abandoned),
            other => Err(CoreError::InvalidPayload {
                field: "sync_state".to_string(),
                message: format!("unknown sync state '{}'", other),
            }),
        }
    }
}

/// Input to [`crate::store::LocalStore::save_record_with_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    /// Business key (student number).
    pub subject_id: String,
    /// When the event happened on the device.
    pub recorded_at: DateTime<Utc>,
    /// Kind-specific data.
    pub data: RecordData,
}

impl NewRecord {
    /// Attendance event captured now.
    pub fn attendance(subject_id: impl Into<String>, status: AttendanceStatus) -> Self {
        Self {
            subject_id: subject_id.into(),
            recorded_at: Utc::now(),
            data: RecordData::Attendance {
                status,
                session: None,
            },
        }
    }

    /// Student registration captured now.
    pub fn student(subject_id: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            recorded_at: Utc::now(),
            data: RecordData::Student {
                full_name: full_name.into(),
                course: None,
                section: None,
            },
        }
    }

    /// Kind of the record being created.
    pub fn kind(&self) -> RecordKind {
        self.data.kind()
    }
}

/// A persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Local sequential identifier.
    pub id: i64,
    /// Record kind.
    pub kind: RecordKind,
    /// Business key.
    pub subject_id: String,
    /// Event time.
    pub recorded_at: DateTime<Utc>,
    /// Kind-specific data.
    pub data: RecordData,
    /// Local artifact (photo) path.
    pub artifact_path: Option<String>,
    /// Device that captured the record.
    pub device_id: String,
    /// Client-generated key sent with every remote write.
    pub idempotency_key: String,
    /// Whether the backend accepted the record.
    pub synced: bool,
    /// Identifier assigned by the backend.
    pub remote_id: Option<String>,
    /// Sync lifecycle state.
    pub sync_state: SyncState,
    /// Last sync error, for abandoned records.
    pub last_error: Option<String>,
    /// When the record was synced.
    pub synced_at: Option<DateTime<Utc>>,
    /// When the record was stored locally.
    pub created_at: DateTime<Utc>,
}

/// Raw `records` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RecordRow {
    pub id: i64,
    pub kind: String,
    pub subject_id: String,
    pub recorded_at: DateTime<Utc>,
    pub data: String,
    pub artifact_path: Option<String>,
    pub device_id: String,
    pub idempotency_key: String,
    pub synced: bool,
    pub remote_id: Option<String>,
    pub sync_state: String,
    pub last_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for Record {
    type Error = CoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(Record {
            id: row.id,
            kind: row.kind.parse()?,
            subject_id: row.subject_id,
            recorded_at: row.recorded_at,
            data: serde_json::from_str(&row.data)?,
            artifact_path: row.artifact_path,
            device_id: row.device_id,
            idempotency_key: row.idempotency_key,
            synced: row.synced,
            remote_id: row.remote_id,
            sync_state: row.sync_state.parse()?,
            last_error: row.last_error,
            synced_at: row.synced_at,
            created_at: row.created_at,
        })
    }
}

/// Everything the orchestrator needs to deliver a record, denormalized into
/// the outbox so delivery never has to read the records table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxPayload {
    /// Local record ID.
    pub record_id: i64,
    /// Business key.
    pub subject_id: String,
    /// Event time.
    pub recorded_at: DateTime<Utc>,
    /// Capturing device.
    pub device_id: String,
    /// Client-generated idempotency key.
    pub idempotency_key: String,
    /// Local artifact path, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    /// Kind-specific data.
    pub data: RecordData,
}

impl OutboxPayload {
    /// Kind of the payload's record.
    pub fn kind(&self) -> RecordKind {
        self.data.kind()
    }

    /// Serialize for storage in `sync_queue.payload`.
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&Record> for OutboxPayload {
    fn from(record: &Record) -> Self {
        OutboxPayload {
            record_id: record.id,
            subject_id: record.subject_id.clone(),
            recorded_at: record.recorded_at,
            device_id: record.device_id.clone(),
            idempotency_key: record.idempotency_key.clone(),
            artifact_path: record.artifact_path.clone(),
            data: record.data.clone(),
        }
    }
}

/// A pending unit of sync work.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OutboxEntry {
    /// Monotonic queue identifier.
    pub queue_id: i64,
    /// Record kind tag.
    pub record_type: String,
    /// Owning record.
    pub record_id: i64,
    /// Opaque serialized [`OutboxPayload`].
    pub payload: String,
    /// Lower drains first.
    pub priority: i64,
    /// Failed delivery attempts so far.
    pub retry_count: i64,
    /// Error text of the last failed attempt.
    pub last_error: Option<String>,
    /// When delivery was last attempted.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the entry was enqueued.
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Decode the stored payload.
    pub fn decode_payload(&self) -> Result<OutboxPayload, CoreError> {
        let payload: OutboxPayload =
            serde_json::from_str(&self.payload).map_err(|e| CoreError::InvalidPayload {
                field: "sync_queue.payload".to_string(),
                message: e.to_string(),
            })?;

        if payload.kind().as_str() != self.record_type {
            return Err(CoreError::InvalidPayload {
                field: "sync_queue.record_type".to_string(),
                message: format!(
                    "entry tagged '{}' carries a {} payload",
                    self.record_type,
                    payload.kind()
                ),
            });
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kind_round_trips_through_tag() {
        for kind in RecordKind::ALL {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("photo".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_students_drain_before_attendance() {
        assert!(RecordKind::Student.default_priority() < RecordKind::Attendance.default_priority());
        assert_eq!(RecordKind::ALL[0], RecordKind::Student);
    }

    #[test]
    fn test_record_data_tag_matches_kind() {
        let data = RecordData::Attendance {
            status: AttendanceStatus::Late,
            session: Some("CS101".to_string()),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "attendance");
        assert_eq!(json["status"], "late");
        assert_eq!(json["session"], "CS101");

        let data = RecordData::Student {
            full_name: "Ana Reyes".to_string(),
            course: None,
            section: None,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "student");
        assert!(json.get("course").is_none());
    }

    #[test]
    fn test_decode_payload_rejects_mismatched_tag() {
        let payload = OutboxPayload {
            record_id: 1,
            subject_id: "2021001".to_string(),
            recorded_at: Utc::now(),
            device_id: "kiosk-01".to_string(),
            idempotency_key: "k".to_string(),
            artifact_path: None,
            data: RecordData::Attendance {
                status: AttendanceStatus::Present,
                session: None,
            },
        };

        let entry = OutboxEntry {
            queue_id: 1,
            record_type: "student".to_string(),
            record_id: 1,
            payload: payload.to_json().unwrap(),
            priority: 0,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
            created_at: Utc::now(),
        };
        let err = entry.decode_payload().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PAYLOAD");

        let entry = OutboxEntry {
            record_type: "attendance".to_string(),
            ..entry
        };
        assert_eq!(entry.decode_payload().unwrap(), payload);
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        let entry = OutboxEntry {
            queue_id: 9,
            record_type: "attendance".to_string(),
            record_id: 9,
            payload: "not json".to_string(),
            priority: 1,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
            created_at: Utc::now(),
        };
        assert!(entry.decode_payload().is_err());
    }

    #[test]
    fn test_sync_state_parse() {
        assert_eq!("abandoned".parse::<SyncState>().unwrap(), SyncState::Abandoned);
        assert!("lost".parse::<SyncState>().is_err());
    }
}
