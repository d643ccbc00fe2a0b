//! SQLite implementation of the storage interfaces.
//!
//! Records, outbox entries and partition leases share one database, so the
//! record upsert and the outbox insert run inside a single transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::schema::{
    Outbox, PartitionLeases, Records, ACQUIRE_LEASE, CREATE_OUTBOX_TABLE,
    CREATE_PARTITION_LEASES_TABLE, CREATE_RECORDS_TABLE, MARK_PUBLISHED_UNDER_LEASE, RENEW_LEASE,
};
use super::{
    parse_status, parse_timestamp, FailPoint, FaultInjector, Lease, LeaseClaim, LeasedBatch,
    MarkOutcome, OutboxStore, RecordSink, RecordStore, Result, StorageError, TransactionalStore,
    WriteMode,
};
use crate::model::{NewOutboxEntry, OutboxEntry, OutboxStatus, Record};

/// SQLite store hosting records, outbox and leases.
pub struct SqliteStore {
    pool: SqlitePool,
    faults: FaultInjector,
}

impl SqliteStore {
    /// Create a new SQLite store over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            faults: FaultInjector::default(),
        }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_RECORDS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::raw_sql(CREATE_OUTBOX_TABLE).execute(&self.pool).await?;
        sqlx::raw_sql(CREATE_PARTITION_LEASES_TABLE)
            .execute(&self.pool)
            .await?;

        info!("Outbox schema initialized (SQLite)");
        Ok(())
    }

    /// Failure injection for the transactional write path.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn upsert_record_query(record: &Record, mode: WriteMode) -> Result<String> {
        let value = serde_json::to_string(&record.value)?;
        let created_at = record.created_at.to_rfc3339();
        let updated_at = Utc::now().to_rfc3339();

        let mut insert = Query::insert();
        insert
            .into_table(Records::Table)
            .columns([
                Records::Id,
                Records::Value,
                Records::CreatedAt,
                Records::UpdatedAt,
            ])
            .values_panic([
                record.id.clone().into(),
                value.into(),
                created_at.into(),
                updated_at.into(),
            ]);

        if mode == WriteMode::Overwrite {
            insert.on_conflict(
                OnConflict::column(Records::Id)
                    .update_columns([Records::Value, Records::CreatedAt, Records::UpdatedAt])
                    .to_owned(),
            );
        }

        Ok(insert.to_string(SqliteQueryBuilder))
    }

    fn insert_entry_query(entry: NewOutboxEntry) -> String {
        Query::insert()
            .into_table(Outbox::Table)
            .columns([
                Outbox::PartitionId,
                Outbox::RecordId,
                Outbox::Payload,
                Outbox::Status,
                Outbox::CreatedAt,
            ])
            .values_panic([
                entry.partition.into(),
                entry.record_id.into(),
                entry.payload.into(),
                OutboxStatus::Pending.as_str().into(),
                Utc::now().to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder)
    }

    fn entry_columns() -> [Outbox; 8] {
        [
            Outbox::Sequence,
            Outbox::PartitionId,
            Outbox::RecordId,
            Outbox::Payload,
            Outbox::Status,
            Outbox::Attempts,
            Outbox::CreatedAt,
            Outbox::LastAttemptAt,
        ]
    }

    fn entry_from_row(row: &SqliteRow) -> Result<OutboxEntry> {
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;
        let partition: i64 = row.try_get("partition_id")?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(OutboxEntry {
            sequence: row.try_get("sequence")?,
            partition: partition as u32,
            record_id: row.try_get("record_id")?,
            payload: row.try_get("payload")?,
            status: parse_status(&status)?,
            attempts: attempts as u32,
            created_at: parse_timestamp(&created_at)?,
            last_attempt_at: last_attempt_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }

    fn record_from_row(row: &SqliteRow) -> Result<Record> {
        let value: String = row.try_get("value")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Record {
            id: row.try_get("id")?,
            value: serde_json::from_str(&value)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

fn map_duplicate(err: sqlx::Error, id: &str) -> StorageError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StorageError::Duplicate {
            id: id.to_string(),
        },
        other => StorageError::Database(other),
    }
}

fn lease_expiry(now: DateTime<Utc>, claim: &LeaseClaim) -> Result<DateTime<Utc>> {
    let duration = chrono::Duration::from_std(claim.duration)
        .map_err(|e| StorageError::InvalidTimestamp(format!("lease duration: {}", e)))?;
    Ok(now + duration)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_record(&self, id: &str) -> Result<Option<Record>> {
        let query = Query::select()
            .columns([Records::Id, Records::Value, Records::CreatedAt])
            .from(Records::Table)
            .and_where(Expr::col(Records::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn count_records(&self) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(Records::Id).count())
            .from(Records::Table)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn append(&self, entry: NewOutboxEntry) -> Result<i64> {
        let query = Self::insert_entry_query(entry);
        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    async fn fetch_pending(
        &self,
        partition: u32,
        limit: usize,
        claim: &LeaseClaim,
    ) -> Result<Option<LeasedBatch>> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, claim)?;

        let mut tx = self.pool.begin().await?;

        let acquired = sqlx::query(ACQUIRE_LEASE)
            .bind(i64::from(partition))
            .bind(&claim.owner)
            .bind(expires_at.timestamp_millis())
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if acquired == 0 {
            tx.rollback().await?;
            debug!(partition, owner = %claim.owner, "Partition leased by another worker");
            return Ok(None);
        }

        let query = Query::select()
            .columns(Self::entry_columns())
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::PartitionId).eq(partition))
            .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Pending.as_str()))
            .order_by(Outbox::Sequence, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let entries = rows
            .iter()
            .map(Self::entry_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(LeasedBatch {
            lease: Lease {
                partition,
                owner: claim.owner.clone(),
                expires_at,
            },
            entries,
        }))
    }

    async fn mark_published(&self, sequence: i64, lease: &Lease) -> Result<MarkOutcome> {
        let now = Utc::now();

        let updated = sqlx::query(MARK_PUBLISHED_UNDER_LEASE)
            .bind(now.to_rfc3339())
            .bind(sequence)
            .bind(i64::from(lease.partition))
            .bind(&lease.owner)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 1 {
            return Ok(MarkOutcome::Published);
        }

        match self.get_entry(sequence).await? {
            None => Err(StorageError::EntryNotFound(sequence)),
            Some(entry) if entry.status == OutboxStatus::Published => {
                Ok(MarkOutcome::AlreadyPublished)
            }
            Some(_) => Err(StorageError::LeaseExpired {
                partition: lease.partition,
            }),
        }
    }

    async fn record_attempt(&self, sequence: i64, attempts: u32) -> Result<()> {
        let query = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Attempts, Expr::col(Outbox::Attempts).add(attempts))
            .value(Outbox::LastAttemptAt, Utc::now().to_rfc3339())
            .and_where(Expr::col(Outbox::Sequence).eq(sequence))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::EntryNotFound(sequence));
        }
        Ok(())
    }

    async fn renew_lease(&self, lease: &Lease, duration: Duration) -> Result<Option<Lease>> {
        let now = Utc::now();
        let claim = LeaseClaim::new(lease.owner.clone(), duration);
        let expires_at = lease_expiry(now, &claim)?;

        let renewed = sqlx::query(RENEW_LEASE)
            .bind(expires_at.timestamp_millis())
            .bind(i64::from(lease.partition))
            .bind(&lease.owner)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if renewed == 0 {
            debug!(partition = lease.partition, owner = %lease.owner, "Lease no longer held");
            return Ok(None);
        }

        Ok(Some(Lease {
            expires_at,
            ..lease.clone()
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let query = Query::delete()
            .from_table(PartitionLeases::Table)
            .and_where(Expr::col(PartitionLeases::PartitionId).eq(lease.partition))
            .and_where(Expr::col(PartitionLeases::Owner).eq(lease.owner.as_str()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn pending_partitions(&self) -> Result<Vec<u32>> {
        let query = Query::select()
            .distinct()
            .column(Outbox::PartitionId)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Pending.as_str()))
            .order_by(Outbox::PartitionId, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let partition: i64 = row.try_get("partition_id")?;
                Ok(partition as u32)
            })
            .collect()
    }

    async fn get_entry(&self, sequence: i64) -> Result<Option<OutboxEntry>> {
        let query = Query::select()
            .columns(Self::entry_columns())
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Sequence).eq(sequence))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn count_entries(&self, status: Option<OutboxStatus>) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(Outbox::Sequence).count())
            .from(Outbox::Table)
            .and_where_option(status.map(|s| Expr::col(Outbox::Status).eq(s.as_str())))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    async fn write_atomic(
        &self,
        record: &Record,
        entry: NewOutboxEntry,
        mode: WriteMode,
    ) -> Result<i64> {
        let upsert = Self::upsert_record_query(record, mode)?;
        let insert = Self::insert_entry_query(entry);

        // Dropping the transaction on any early return rolls both writes back.
        let mut tx = self.pool.begin().await?;

        sqlx::query(&upsert)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_duplicate(e, &record.id))?;

        self.faults.trip(FailPoint::AfterRecordUpsert)?;

        let sequence = sqlx::query(&insert)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        self.faults.trip(FailPoint::AfterOutboxAppend)?;

        tx.commit().await?;

        debug!(record_id = %record.id, sequence, "Record and outbox entry committed");
        Ok(sequence)
    }
}

#[async_trait]
impl RecordSink for SqliteStore {
    async fn apply(&self, record: &Record) -> Result<()> {
        let query = Self::upsert_record_query(record, WriteMode::Overwrite)?;
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
