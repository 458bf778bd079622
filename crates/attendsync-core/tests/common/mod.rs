// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for attendsync-core integration tests.
//!
//! Provides a scripted [`RemoteBackend`] and a [`TestContext`] wiring an
//! in-memory store to an orchestrator.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use attendsync_core::model::{AttendanceStatus, NewRecord};
use attendsync_core::remote::{RemoteBackend, RemoteError, RemoteRecord};
use attendsync_core::{ConnectivityState, Database, LocalStore, SyncConfig, SyncOrchestrator};

/// Backend whose answers are scripted by the test.
///
/// Queued responses are consumed first; once empty, every call gets the
/// default response.
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<String, RemoteError>>>,
    default_response: Mutex<Result<String, RemoteError>>,
    upload_response: Mutex<Result<String, RemoteError>>,
    delay: Mutex<Option<Duration>>,
    insert_calls: AtomicU32,
    upload_calls: AtomicU32,
    bodies: Mutex<Vec<(String, RemoteRecord)>>,
}

impl ScriptedBackend {
    pub fn accepting(remote_id: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(Ok(remote_id.to_string())),
            upload_response: Mutex::new(Ok("https://cdn.example/object".to_string())),
            delay: Mutex::new(None),
            insert_calls: AtomicU32::new(0),
            upload_calls: AtomicU32::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: RemoteError) -> Self {
        let backend = Self::accepting("unused");
        backend.set_default(Err(error));
        backend
    }

    pub fn set_default(&self, response: Result<String, RemoteError>) {
        *self.default_response.lock().unwrap() = response;
    }

    pub fn push(&self, response: Result<String, RemoteError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_upload(&self, response: Result<String, RemoteError>) {
        *self.upload_response.lock().unwrap() = response;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// `(resource, body)` of every insert, in call order.
    pub fn bodies(&self) -> Vec<(String, RemoteRecord)> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteBackend for ScriptedBackend {
    async fn insert_record(&self, resource: &str, record: &RemoteRecord) -> Result<String, RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .lock()
            .unwrap()
            .push((resource.to_string(), record.clone()));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default_response.lock().unwrap().clone())
    }

    async fn upload_artifact(&self, _object: &str, _bytes: Vec<u8>) -> Result<String, RemoteError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.upload_response.lock().unwrap().clone()
    }

    async fn probe(&self) -> Result<Duration, RemoteError> {
        Ok(Duration::from_millis(3))
    }
}

/// In-memory store, scripted backend and orchestrator.
pub struct TestContext {
    pub store: LocalStore,
    pub backend: Arc<ScriptedBackend>,
    pub connectivity: ConnectivityState,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl TestContext {
    pub async fn new(backend: ScriptedBackend, config: SyncConfig) -> Self {
        let store = LocalStore::new(Database::in_memory().await.expect("in-memory database"));
        let backend = Arc::new(backend);
        let connectivity = ConnectivityState::new(true);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            backend.clone(),
            connectivity.clone(),
            config,
        ));

        Self {
            store,
            backend,
            connectivity,
            orchestrator,
        }
    }

    pub async fn save_attendance(&self, subject_id: &str) -> i64 {
        self.store
            .save_record_with_queue(
                &NewRecord::attendance(subject_id, AttendanceStatus::Present),
                None,
                "kiosk-test",
            )
            .await
            .expect("save attendance")
    }

    pub async fn save_student(&self, subject_id: &str, full_name: &str) -> i64 {
        self.store
            .save_record_with_queue(&NewRecord::student(subject_id, full_name), None, "kiosk-test")
            .await
            .expect("save student")
    }

    /// Assert that pending records and outbox entries match per type.
    pub async fn assert_consistent(&self) {
        assert_eq!(
            self.store.pending_by_type().await.unwrap(),
            self.store.outbox().size_by_type().await.unwrap(),
            "pending records and outbox entries diverged"
        );
    }
}

pub fn transient() -> RemoteError {
    RemoteError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }
}

pub fn permanent() -> RemoteError {
    RemoteError::Status {
        status: 422,
        body: "unprocessable".to_string(),
    }
}
