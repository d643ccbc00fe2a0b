//! Storage interfaces and implementations.
//!
//! The primary records and the outbox live in the same transactional engine,
//! so a record upsert and its outbox entry commit or roll back together.
//!
//! - `RecordStore`: read access to committed records
//! - `OutboxStore`: append, fetch-and-lease, mark published
//! - `TransactionalStore`: the atomic record + outbox write
//! - `RecordSink`: consumer-side replica upsert
//!
//! Implementations: `SqliteStore`.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::config::StorageConfig;
use crate::model::{NewOutboxEntry, OutboxEntry, OutboxStatus, Record};

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Record already exists: {id}")]
    Duplicate { id: String },

    #[error("Outbox entry not found: sequence={0}")]
    EntryNotFound(i64),

    #[error("Lease on partition {partition} expired or is held by another worker")]
    LeaseExpired { partition: u32 },

    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Injected failure at {0:?}")]
    Injected(FailPoint),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an upsert treats an existing record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `StorageError::Duplicate`.
    Reject,
    /// Replace the stored value; a new outbox entry is still appended.
    Overwrite,
}

/// Request to hold a partition's pending queue.
#[derive(Debug, Clone)]
pub struct LeaseClaim {
    pub owner: String,
    pub duration: Duration,
}

impl LeaseClaim {
    pub fn new(owner: impl Into<String>, duration: Duration) -> Self {
        Self {
            owner: owner.into(),
            duration,
        }
    }
}

/// Time-bounded exclusive claim on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub partition: u32,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Pending entries fetched under a lease, in ascending sequence order.
#[derive(Debug, Clone)]
pub struct LeasedBatch {
    pub lease: Lease,
    pub entries: Vec<OutboxEntry>,
}

/// Result of `mark_published`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call performed the PENDING -> PUBLISHED transition.
    Published,
    /// The entry was already PUBLISHED; nothing changed.
    AlreadyPublished,
}

/// Points inside the atomic write where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Record upserted, outbox entry not yet inserted.
    AfterRecordUpsert,
    /// Both rows written, transaction not yet committed.
    AfterOutboxAppend,
}

/// One-shot failure injection for the transactional write path.
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<Option<FailPoint>>,
}

impl FaultInjector {
    /// Fail the next write that reaches `point`.
    pub fn arm(&self, point: FailPoint) {
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = Some(point);
    }

    pub fn disarm(&self) {
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn trip(&self, point: FailPoint) -> Result<()> {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if *armed == Some(point) {
            *armed = None;
            return Err(StorageError::Injected(point));
        }
        Ok(())
    }
}

/// Read access to the primary store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a committed record.
    async fn get_record(&self, id: &str) -> Result<Option<Record>>;

    /// Number of committed records.
    async fn count_records(&self) -> Result<u64>;
}

/// Durable record of pending publications.
///
/// All relay coordination goes through this store: a partition's pending
/// entries are only handed to the current lease holder.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a pending entry in its own transaction.
    async fn append(&self, entry: NewOutboxEntry) -> Result<i64>;

    /// Lease `partition` for `claim.owner` and return up to `limit` pending
    /// entries in ascending sequence order.
    ///
    /// An existing lease held by the same owner is renewed. Returns `None`
    /// while another owner holds an unexpired lease.
    async fn fetch_pending(
        &self,
        partition: u32,
        limit: usize,
        claim: &LeaseClaim,
    ) -> Result<Option<LeasedBatch>>;

    /// Transition an entry to PUBLISHED while `lease` is still valid.
    ///
    /// Idempotent: an already-published entry yields `AlreadyPublished`.
    async fn mark_published(&self, sequence: i64, lease: &Lease) -> Result<MarkOutcome>;

    /// Add `attempts` publish attempts and stamp `last_attempt_at`.
    async fn record_attempt(&self, sequence: i64, attempts: u32) -> Result<()>;

    /// Extend `lease` by `duration` from now.
    ///
    /// Returns the renewed lease, or `None` when it expired or changed hands.
    /// An expired lease is never revived.
    async fn renew_lease(&self, lease: &Lease, duration: Duration) -> Result<Option<Lease>>;

    /// Drop a lease early if it is still owned.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Partitions that currently have pending entries.
    async fn pending_partitions(&self) -> Result<Vec<u32>>;

    async fn get_entry(&self, sequence: i64) -> Result<Option<OutboxEntry>>;

    /// Count entries, optionally filtered by status.
    async fn count_entries(&self, status: Option<OutboxStatus>) -> Result<u64>;
}

/// Engine hosting both the records and the outbox.
#[async_trait]
pub trait TransactionalStore: RecordStore + OutboxStore {
    /// Upsert `record` and append `entry` in a single transaction.
    ///
    /// Either both writes are visible after return, or neither is.
    async fn write_atomic(&self, record: &Record, entry: NewOutboxEntry, mode: WriteMode)
        -> Result<i64>;
}

/// Consumer-side destination for relayed records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Upsert a record. Applying the same record twice is harmless.
    async fn apply(&self, record: &Record) -> Result<()>;
}

/// Initialize the SQLite store described by `config`.
///
/// `:memory:` databases get a single connection that is never recycled,
/// otherwise every pooled connection would see its own empty database.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<SqliteStore>> {
    info!(path = %config.path, "Storage: sqlite");

    let pool = if config.is_memory() {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?
    } else {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(&config.path)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await?
    };

    let store = Arc::new(SqliteStore::new(pool));
    store.init().await?;
    Ok(store)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{}: {}", raw, e)))
}

pub(crate) fn parse_status(raw: &str) -> Result<OutboxStatus> {
    raw.parse().map_err(StorageError::InvalidStatus)
}
