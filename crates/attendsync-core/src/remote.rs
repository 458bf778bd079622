// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote backend client.
//!
//! The orchestrator talks to the backend only through [`RemoteBackend`], so
//! tests can swap in a scripted implementation. [`HttpBackend`] is the REST
//! implementation:
//!
//! - `POST {base}/{resource}` with the JSON record, answered by `{"id": ..}`
//!   or `[{"id": ..}]`
//! - `PUT {base}/{artifact_resource}/{object}` with raw bytes, answered by an
//!   optional `{"url": ..}`
//! - `GET {base}/{health_path}` as a reachability probe

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::model::{OutboxPayload, RecordData};

/// Failure talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The request exceeded its timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The backend could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The backend answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The backend answered 2xx but the body was not understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Any other transport failure.
    #[error("request failed: {0}")]
    Request(String),

    /// A local artifact could not be read for upload.
    #[error("artifact {path} unreadable: {details}")]
    Artifact {
        /// Local path.
        path: String,
        /// Error details.
        details: String,
    },
}

impl RemoteError {
    /// Whether the failure says something about endpoint health and is
    /// worth retrying: timeouts, connection failures, 5xx, 408 and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Timeout(_) | RemoteError::Connect(_) | RemoteError::Request(_) => true,
            RemoteError::Status { status, .. } => {
                *status >= 500
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            RemoteError::InvalidResponse(_) | RemoteError::Artifact { .. } => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout(err.to_string())
        } else if err.is_connect() {
            RemoteError::Connect(err.to_string())
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else {
            RemoteError::Request(err.to_string())
        }
    }
}

/// JSON body of a record write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Local record ID on the capturing device.
    pub local_id: i64,
    /// Business key.
    pub subject_id: String,
    /// Event time.
    pub recorded_at: DateTime<Utc>,
    /// Capturing device.
    pub device_id: String,
    /// Client-generated key; the backend upserts on it.
    pub idempotency_key: String,
    /// Public URL of the uploaded artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
    /// Kind tag and kind-specific fields.
    #[serde(flatten)]
    pub data: RecordData,
}

impl RemoteRecord {
    /// Build the request body from an outbox payload.
    pub fn from_payload(payload: &OutboxPayload, artifact_url: Option<String>) -> Self {
        Self {
            local_id: payload.record_id,
            subject_id: payload.subject_id.clone(),
            recorded_at: payload.recorded_at,
            device_id: payload.device_id.clone(),
            idempotency_key: payload.idempotency_key.clone(),
            artifact_url,
            data: payload.data.clone(),
        }
    }
}

/// Content-addressed object name for an artifact: SHA-256 of the bytes,
/// keeping the source file's extension.
pub fn artifact_object_name(bytes: &[u8], source: &Path) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    match source.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{}.{}", digest, ext.to_ascii_lowercase()),
        _ => digest,
    }
}

/// Operations the orchestrator needs from the backend.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Write one record to `resource`, returning the backend's ID for it.
    async fn insert_record(&self, resource: &str, record: &RemoteRecord) -> Result<String, RemoteError>;

    /// Store an artifact under `object`, returning its URL.
    async fn upload_artifact(&self, object: &str, bytes: Vec<u8>) -> Result<String, RemoteError>;

    /// Check reachability, returning the round-trip latency.
    async fn probe(&self) -> Result<Duration, RemoteError>;
}

/// Settings for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL, e.g. `https://api.example.com/rest/v1`.
    pub base_url: String,
    /// Bearer token sent on every call.
    pub api_key: String,
    /// Resource that stores artifacts.
    pub artifact_resource: String,
    /// Path probed for reachability.
    pub health_path: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl HttpBackendConfig {
    /// Config with default resource names and timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            artifact_resource: "artifacts".to_string(),
            health_path: "health".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// REST implementation of [`RemoteBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    config: HttpBackendConfig,
}

const MAX_ERROR_BODY: usize = 512;

impl HttpBackend {
    /// Build a client with the configured timeout.
    pub fn new(config: HttpBackendConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self, tail: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            tail.trim_start_matches('/')
        )
    }

    async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn extract_id(body: &Value) -> Option<String> {
    let id = match body {
        Value::Array(items) => items.first()?.get("id")?,
        Value::Object(map) => map.get("id")?,
        _ => return None,
    };

    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn insert_record(&self, resource: &str, record: &RemoteRecord) -> Result<String, RemoteError> {
        let url = self.url(resource);
        debug!(url = %url, local_id = record.local_id, "Inserting record");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", &record.idempotency_key)
            .json(record)
            .send()
            .await?;

        let response = Self::error_for_status(response).await?;
        let body: Value = response.json().await?;

        extract_id(&body).ok_or_else(|| {
            RemoteError::InvalidResponse(format!("no id in response from {}", resource))
        })
    }

    async fn upload_artifact(&self, object: &str, bytes: Vec<u8>) -> Result<String, RemoteError> {
        let object_path = format!("{}/{}", self.config.artifact_resource, object);
        let url = self.url(&object_path);
        debug!(url = %url, size = bytes.len(), "Uploading artifact");

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        let response = Self::error_for_status(response).await?;
        let body = response.bytes().await?;

        let remote_url = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("url").and_then(Value::as_str).map(str::to_string));

        Ok(remote_url.unwrap_or(url))
    }

    async fn probe(&self) -> Result<Duration, RemoteError> {
        let started = Instant::now();
        self.client
            .get(self.url(&self.config.health_path))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        Ok(started.elapsed())
    }
}
