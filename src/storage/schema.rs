//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Primary records table schema.
#[derive(Iden)]
pub enum Records {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "value"]
    Value,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    Table,
    #[iden = "sequence"]
    Sequence,
    #[iden = "partition_id"]
    PartitionId,
    #[iden = "record_id"]
    RecordId,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "attempts"]
    Attempts,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "last_attempt_at"]
    LastAttemptAt,
    #[iden = "published_at"]
    PublishedAt,
}

/// Partition lease table schema.
#[derive(Iden)]
pub enum PartitionLeases {
    Table,
    #[iden = "partition_id"]
    PartitionId,
    #[iden = "owner"]
    Owner,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// SQL for creating the records table.
pub const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQL for creating the outbox table.
///
/// AUTOINCREMENT keeps sequences strictly increasing even after rows are
/// compacted away.
pub const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_id INTEGER NOT NULL,
    record_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_attempt_at TEXT,
    published_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(partition_id, status, sequence);
CREATE INDEX IF NOT EXISTS idx_outbox_record ON outbox(record_id);
"#;

/// SQL for creating the partition lease table.
pub const CREATE_PARTITION_LEASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS partition_leases (
    partition_id INTEGER PRIMARY KEY NOT NULL,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

/// Take or renew a partition lease.
///
/// The update only applies when the caller already owns the lease or the
/// current one has expired, so zero affected rows means "held elsewhere".
/// Binds: partition, owner, new expiry (epoch ms), now (epoch ms).
pub const ACQUIRE_LEASE: &str = r#"
INSERT INTO partition_leases (partition_id, owner, expires_at) VALUES (?1, ?2, ?3)
ON CONFLICT(partition_id) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
WHERE partition_leases.owner = excluded.owner OR partition_leases.expires_at <= ?4
"#;

/// Extend a lease the caller still holds.
///
/// Unlike `ACQUIRE_LEASE` this never takes over an expired lease: once it
/// lapsed another worker may have relayed the partition in between.
/// Binds: new expiry (epoch ms), partition, owner, now (epoch ms).
pub const RENEW_LEASE: &str = r#"
UPDATE partition_leases SET expires_at = ?1
WHERE partition_id = ?2 AND owner = ?3 AND expires_at > ?4
"#;

/// Publish an entry only while the caller's lease is live.
///
/// Binds: published_at, sequence, partition, owner, now (epoch ms).
pub const MARK_PUBLISHED_UNDER_LEASE: &str = r#"
UPDATE outbox SET status = 'PUBLISHED', published_at = ?1
WHERE sequence = ?2 AND partition_id = ?3 AND status = 'PENDING'
  AND EXISTS (
    SELECT 1 FROM partition_leases
    WHERE partition_leases.partition_id = ?3
      AND partition_leases.owner = ?4
      AND partition_leases.expires_at > ?5
  )
"#;
