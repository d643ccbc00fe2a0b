//! Write coordinator: the synchronous ingestion path.
//!
//! Validates an inbound record at the boundary, then commits the primary
//! record and its outbox entry in one transaction. Publication to the event
//! log happens later, in the relay; a committed write is acknowledged
//! regardless of downstream publish timing.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RecordLimits;
use crate::model::{Ack, NewOutboxEntry, Record, RecordRequest};
use crate::storage::{StorageError, TransactionalStore, WriteMode};

/// What `submit` does when the record id already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Fail with `WriteError::Duplicate`; no outbox entry is appended.
    #[default]
    Reject,
    /// Replace the stored value and append a new outbox entry.
    Overwrite,
}

impl From<DuplicatePolicy> for WriteMode {
    fn from(policy: DuplicatePolicy) -> Self {
        match policy {
            DuplicatePolicy::Reject => WriteMode::Reject,
            DuplicatePolicy::Overwrite => WriteMode::Overwrite,
        }
    }
}

/// Write coordinator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Number of outbox partitions records are hashed into.
    pub partitions: u32,
    pub on_duplicate: DuplicatePolicy,
    pub limits: RecordLimits,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            partitions: 16,
            on_duplicate: DuplicatePolicy::Reject,
            limits: RecordLimits::default(),
        }
    }
}

/// Inbound record rejected before any write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Record id must not be empty")]
    EmptyId,

    #[error("Record id is {len} bytes, limit is {max}")]
    IdTooLong { len: usize, max: usize },

    #[error("Record value is {size} bytes, limit is {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Record value is not serializable: {0}")]
    Unserializable(String),
}

/// Errors visible to submitters.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),

    #[error("Record already exists: {id}")]
    Duplicate { id: String },

    /// The transaction did not commit; nothing was written.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] StorageError),
}

impl WriteError {
    /// Whether resubmitting the same record can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::StorageUnavailable(_))
    }
}

impl From<StorageError> for WriteError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate { id } => WriteError::Duplicate { id },
            other => WriteError::StorageUnavailable(other),
        }
    }
}

/// Validates records and commits them together with their outbox entry.
///
/// Holds no mutable state; concurrent submits share only the store.
pub struct WriteCoordinator {
    store: Arc<dyn TransactionalStore>,
    config: CoordinatorConfig,
}

impl WriteCoordinator {
    pub fn new(store: Arc<dyn TransactionalStore>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Turn an inbound request into a record, or reject it.
    ///
    /// A missing id gets a fresh UUID. A supplied id is trimmed.
    pub fn validate(&self, request: RecordRequest) -> Result<Record, ValidationError> {
        let limits = &self.config.limits;

        let id = match request.id {
            Some(id) => {
                let id = id.trim();
                if id.is_empty() {
                    return Err(ValidationError::EmptyId);
                }
                id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        if id.len() > limits.max_id_len {
            return Err(ValidationError::IdTooLong {
                len: id.len(),
                max: limits.max_id_len,
            });
        }

        let size = serde_json::to_vec(&request.value)
            .map_err(|e| ValidationError::Unserializable(e.to_string()))?
            .len();
        if size > limits.max_value_bytes {
            return Err(ValidationError::ValueTooLarge {
                size,
                max: limits.max_value_bytes,
            });
        }

        Ok(Record {
            id,
            value: request.value,
            created_at: Utc::now(),
        })
    }

    /// Validate and durably record `request`.
    ///
    /// On `Ok`, the record and its PENDING outbox entry are both committed.
    /// On any `Err`, neither is.
    #[tracing::instrument(name = "coordinator.submit", skip_all, fields(record_id = tracing::field::Empty))]
    pub async fn submit(&self, request: RecordRequest) -> Result<Ack, WriteError> {
        let record = self.validate(request)?;
        tracing::Span::current().record("record_id", record.id.as_str());

        let entry = NewOutboxEntry::for_record(&record, self.config.partitions)
            .map_err(|e| ValidationError::Unserializable(e.to_string()))?;
        let partition = entry.partition;

        let sequence = self
            .store
            .write_atomic(&record, entry, self.config.on_duplicate.into())
            .await
            .map_err(|e| {
                let err = WriteError::from(e);
                if err.is_retryable() {
                    warn!(record_id = %record.id, error = %err, "Transactional write failed");
                }
                err
            })?;

        debug!(record_id = %record.id, sequence, partition, "Record accepted");

        Ok(Ack {
            record_id: record.id,
            sequence,
            partition,
        })
    }
}
