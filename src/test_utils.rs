//! Test utilities and mock implementations.
//!
//! Helpers for building in-memory stores, sample records and recording
//! handlers without touching the filesystem or a broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::bus::{BusError, EventHandler, EventMessage};
use crate::config::StorageConfig;
use crate::model::Record;
use crate::storage::{init_storage, RecordSink, Result as StorageResult, SqliteStore, StorageError};

/// Fresh in-memory SQLite store with schema applied.
pub async fn memory_store() -> Arc<SqliteStore> {
    init_storage(&StorageConfig::memory())
        .await
        .expect("in-memory store should initialize")
}

/// Record with a small JSON payload.
pub fn sample_record(id: &str) -> Record {
    Record {
        id: id.to_string(),
        value: serde_json::json!({"id": id, "valor": 42}),
        created_at: Utc::now(),
    }
}

/// Sink that remembers every applied record.
#[derive(Default)]
pub struct CountingSink {
    applied: RwLock<Vec<Record>>,
    fail: AtomicBool,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn applied(&self) -> Vec<Record> {
        self.applied.read().await.clone()
    }

    pub async fn applied_count(&self) -> usize {
        self.applied.read().await.len()
    }
}

#[async_trait]
impl RecordSink for CountingSink {
    async fn apply(&self, record: &Record) -> StorageResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::InvalidStatus("sink unavailable".to_string()));
        }
        self.applied.write().await.push(record.clone());
        Ok(())
    }
}

/// Event handler that records every delivered message.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    messages: Arc<RwLock<Vec<Arc<EventMessage>>>>,
    count: Arc<AtomicUsize>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }

    pub async fn messages(&self) -> Vec<Arc<EventMessage>> {
        self.messages.read().await.clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, message: Arc<EventMessage>) -> BoxFuture<'static, Result<(), BusError>> {
        let messages = Arc::clone(&self.messages);
        let count = Arc::clone(&self.count);
        Box::pin(async move {
            messages.write().await.push(message);
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
