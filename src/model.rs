//! Core data types shared by the coordinator, outbox and relay.
//!
//! A `Record` is the business payload. Every committed version of a record
//! gets exactly one `OutboxEntry`, whose payload is the JSON snapshot of the
//! record at write time. The relay wraps that snapshot in an `EventEnvelope`
//! before publishing so consumers can deduplicate on `(record_id, sequence)`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Business record owned by the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier within the primary store.
    pub id: String,
    /// Opaque payload.
    pub value: serde_json::Value,
    /// When the coordinator accepted this version of the record.
    pub created_at: DateTime<Utc>,
}

/// Inbound submission, validated by the coordinator before any write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRequest {
    /// Client-supplied id. Generated by the coordinator when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Payload. `valor` is accepted for compatibility with the legacy
    /// ingestion endpoint.
    #[serde(alias = "valor")]
    pub value: serde_json::Value,
}

impl RecordRequest {
    pub fn new(id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: Some(id.into()),
            value,
        }
    }

    /// Request without an id; the coordinator assigns one.
    pub fn anonymous(value: serde_json::Value) -> Self {
        Self { id: None, value }
    }
}

/// Publication state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            other => Err(format!("unknown outbox status: {}", other)),
        }
    }
}

/// Durable intent to publish one record version.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Store-assigned, strictly increasing.
    pub sequence: i64,
    pub partition: u32,
    /// Reference to the record, not ownership.
    pub record_id: String,
    /// JSON snapshot of the record at write time.
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Outbox entry before the store assigns its sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub partition: u32,
    pub record_id: String,
    pub payload: Vec<u8>,
}

impl NewOutboxEntry {
    /// Snapshot a record into a pending entry for its partition.
    pub fn for_record(record: &Record, partitions: u32) -> Result<Self, serde_json::Error> {
        Ok(Self {
            partition: partition_for(&record.id, partitions),
            record_id: record.id.clone(),
            payload: serde_json::to_vec(record)?,
        })
    }
}

/// Acknowledgment returned to a submitter once the transaction committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub record_id: String,
    pub sequence: i64,
    pub partition: u32,
}

/// Message body published to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: i64,
    pub partition: u32,
    pub record_id: String,
    pub record: Record,
}

impl EventEnvelope {
    /// Build the envelope for an outbox entry by decoding its snapshot.
    pub fn from_entry(entry: &OutboxEntry) -> Result<Self, serde_json::Error> {
        let record: Record = serde_json::from_slice(&entry.payload)?;
        Ok(Self {
            sequence: entry.sequence,
            partition: entry.partition,
            record_id: entry.record_id.clone(),
            record,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Stable partition assignment for a record id.
///
/// Uses the first 8 bytes of SHA-256 so the mapping does not change across
/// processes or releases. `partitions == 0` is treated as a single partition.
pub fn partition_for(record_id: &str, partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    let digest = Sha256::digest(record_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions)) as u32
}
