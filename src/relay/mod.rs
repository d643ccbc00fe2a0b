//! Outbox relay: drains pending entries into the event log.
//!
//! A relay worker walks the partitions that have pending entries, leases
//! one partition at a time and publishes its entries in ascending sequence
//! order. An entry is marked PUBLISHED only after the log confirmed the
//! write, so a crash anywhere in between leaves it PENDING and it is
//! published again once the lease expires (at-least-once).
//!
//! Workers hold no state of their own. Any number of them can run against
//! the same store; the partition lease is the only coordination.
//!
//! The lease is renewed before every publish attempt. Once it lapsed the
//! worker abandons the batch instead of publishing alongside a new holder.
//!
//! Transient publish failures are retried with capped exponential backoff.
//! When retries run out the partition stalls: the entry stays PENDING, an
//! alert is emitted and later entries of that partition wait, preserving
//! per-key order. Other partitions keep flowing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, Delivery, EventLog};
use crate::config::DEFAULT_TOPIC;
use crate::model::{EventEnvelope, OutboxEntry};
use crate::storage::{Lease, LeaseClaim, MarkOutcome, OutboxStore, StorageError};
use crate::utils::retry::relay_backoff;

/// Alerts buffered per subscriber before the oldest are dropped.
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Relay worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Lease owner identity. A random id is generated when unset.
    pub worker_id: Option<String>,
    /// Worker tasks started by the relay binary.
    pub workers: usize,
    /// Topic entries are published to; filled from `messaging.topic`.
    #[serde(skip)]
    pub topic: String,
    /// Entries fetched per lease.
    pub batch_size: usize,
    /// Sleep between cycles that published nothing.
    pub poll_interval_ms: u64,
    /// How long a partition lease lasts without renewal.
    pub lease_duration_ms: u64,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Retries after the first publish attempt before the partition stalls.
    pub max_retries: usize,
    /// This worker only handles partitions where
    /// `partition % shard_count == shard_index`.
    pub shard_index: u32,
    pub shard_count: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            workers: 1,
            topic: DEFAULT_TOPIC.to_string(),
            batch_size: 100,
            poll_interval_ms: 500,
            lease_duration_ms: 30_000,
            retry_min_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            max_retries: 5,
            shard_index: 0,
            shard_count: 1,
        }
    }
}

/// Operational alert: an entry could not be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAlert {
    pub worker_id: String,
    pub partition: u32,
    pub sequence: i64,
    pub record_id: String,
    /// Publish attempts made in this round.
    pub attempts: u32,
    pub error: String,
}

/// What happened to one partition in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Lease acquired, nothing pending.
    Idle,
    /// Another worker holds the lease.
    Contended,
    /// Every fetched entry was published.
    Drained { published: usize },
    /// Publishing `sequence` failed permanently or ran out of retries.
    Stalled { published: usize, sequence: i64 },
    /// The lease expired mid-batch; the remaining entries are re-leased later.
    LeaseLost { published: usize },
}

impl PartitionOutcome {
    pub fn published(&self) -> usize {
        match *self {
            PartitionOutcome::Idle | PartitionOutcome::Contended => 0,
            PartitionOutcome::Drained { published }
            | PartitionOutcome::Stalled { published, .. }
            | PartitionOutcome::LeaseLost { published } => published,
        }
    }
}

/// Summary of one `run_cycle`.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(u32, PartitionOutcome)>,
    /// Partitions skipped because of a storage error.
    pub failed: Vec<u32>,
}

impl CycleReport {
    pub fn published(&self) -> usize {
        self.outcomes.iter().map(|(_, o)| o.published()).sum()
    }

    pub fn outcome(&self, partition: u32) -> Option<PartitionOutcome> {
        self.outcomes
            .iter()
            .find(|(p, _)| *p == partition)
            .map(|(_, o)| *o)
    }
}

enum EntryResult {
    Marked,
    Stalled,
    LeaseLost,
}

/// Why a publish round ended without a confirmed delivery.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Bus(BusError),
    #[error("partition lease no longer held")]
    LeaseLost,
    #[error(transparent)]
    Storage(StorageError),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Bus(e) if e.is_transient())
    }
}

/// One relay worker.
pub struct Relay {
    store: Arc<dyn OutboxStore>,
    log: Arc<dyn EventLog>,
    config: RelayConfig,
    worker_id: String,
    alerts: broadcast::Sender<RelayAlert>,
    stop: watch::Sender<bool>,
}

impl Relay {
    pub fn new(store: Arc<dyn OutboxStore>, log: Arc<dyn EventLog>, config: RelayConfig) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("relay-{}", Uuid::new_v4()));
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);

        Self {
            store,
            log,
            config,
            worker_id,
            alerts,
            stop,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Subscribe to stall alerts emitted from now on.
    pub fn alerts(&self) -> broadcast::Receiver<RelayAlert> {
        self.alerts.subscribe()
    }

    /// Ask the worker to stop at the next checkpoint (between batches).
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Whether this worker's shard covers `partition`.
    pub fn owns(&self, partition: u32) -> bool {
        let shards = self.config.shard_count.max(1);
        partition % shards == self.config.shard_index % shards
    }

    fn claim(&self) -> LeaseClaim {
        LeaseClaim::new(
            self.worker_id.clone(),
            Duration::from_millis(self.config.lease_duration_ms),
        )
    }

    /// One pass over every pending partition this worker owns.
    ///
    /// A storage error or stall in one partition is recorded and the pass
    /// moves on to the next.
    pub async fn run_cycle(&self) -> Result<CycleReport, StorageError> {
        let mut report = CycleReport::default();

        for partition in self.store.pending_partitions().await? {
            if self.is_stopping() {
                break;
            }
            if !self.owns(partition) {
                continue;
            }

            match self.relay_partition(partition).await {
                Ok(outcome) => report.outcomes.push((partition, outcome)),
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        partition,
                        error = %e,
                        "Partition relay failed"
                    );
                    report.failed.push(partition);
                }
            }
        }

        Ok(report)
    }

    /// Lease `partition` and publish its pending entries in sequence order.
    #[tracing::instrument(name = "relay.partition", skip(self), fields(worker_id = %self.worker_id))]
    pub async fn relay_partition(&self, partition: u32) -> Result<PartitionOutcome, StorageError> {
        let claim = self.claim();
        let mut published = 0;

        loop {
            let batch = match self
                .store
                .fetch_pending(partition, self.config.batch_size, &claim)
                .await?
            {
                Some(batch) => batch,
                None if published == 0 => {
                    debug!("Partition leased by another worker");
                    return Ok(PartitionOutcome::Contended);
                }
                None => return Ok(PartitionOutcome::LeaseLost { published }),
            };

            if batch.entries.is_empty() {
                self.store.release_lease(&batch.lease).await?;
                return Ok(if published == 0 {
                    PartitionOutcome::Idle
                } else {
                    PartitionOutcome::Drained { published }
                });
            }

            let full = batch.entries.len() >= self.config.batch_size;

            for entry in &batch.entries {
                match self.relay_entry(entry, &batch.lease).await? {
                    EntryResult::Marked => published += 1,
                    EntryResult::Stalled => {
                        self.store.release_lease(&batch.lease).await?;
                        return Ok(PartitionOutcome::Stalled {
                            published,
                            sequence: entry.sequence,
                        });
                    }
                    EntryResult::LeaseLost => {
                        warn!(
                            sequence = entry.sequence,
                            published, "Lease lost mid-batch, remaining entries re-leased later"
                        );
                        return Ok(PartitionOutcome::LeaseLost { published });
                    }
                }
            }

            if !full || self.is_stopping() {
                self.store.release_lease(&batch.lease).await?;
                info!(published, "Partition drained");
                return Ok(PartitionOutcome::Drained { published });
            }
        }
    }

    async fn relay_entry(
        &self,
        entry: &OutboxEntry,
        lease: &Lease,
    ) -> Result<EntryResult, StorageError> {
        let (attempts, result) = self.publish(entry, lease).await;

        if attempts > 0 {
            self.store.record_attempt(entry.sequence, attempts).await?;
        }

        let delivery = match result {
            Ok(delivery) => delivery,
            Err(AttemptError::Bus(e)) => {
                self.raise_alert(entry, attempts, &e);
                return Ok(EntryResult::Stalled);
            }
            Err(AttemptError::LeaseLost) => return Ok(EntryResult::LeaseLost),
            Err(AttemptError::Storage(e)) => return Err(e),
        };

        debug!(
            sequence = entry.sequence,
            record_id = %entry.record_id,
            log_partition = delivery.partition,
            log_offset = delivery.offset,
            attempts,
            "Entry confirmed by event log"
        );

        match self.store.mark_published(entry.sequence, lease).await {
            Ok(MarkOutcome::Published) => Ok(EntryResult::Marked),
            // Only another lease holder can have published a leased entry.
            Ok(MarkOutcome::AlreadyPublished) | Err(StorageError::LeaseExpired { .. }) => {
                Ok(EntryResult::LeaseLost)
            }
            Err(e) => Err(e),
        }
    }

    /// Publish one entry with retries. Returns the attempts made.
    ///
    /// The lease is renewed before every attempt, so a retry never goes out
    /// once another worker may own the partition.
    async fn publish(
        &self,
        entry: &OutboxEntry,
        lease: &Lease,
    ) -> (u32, Result<Delivery, AttemptError>) {
        let payload = match EventEnvelope::from_entry(entry).and_then(|env| env.encode()) {
            Ok(payload) => payload,
            Err(e) => {
                return (
                    0,
                    Err(AttemptError::Bus(BusError::Rejected(format!(
                        "undecodable outbox payload: {}",
                        e
                    )))),
                )
            }
        };

        let lease_duration = Duration::from_millis(self.config.lease_duration_ms);
        let attempts = AtomicU32::new(0);
        let (payload, attempts_ref) = (&payload, &attempts);

        let result = (move || async move {
            match self.store.renew_lease(lease, lease_duration).await {
                Ok(Some(_)) => {}
                Ok(None) => return Err(AttemptError::LeaseLost),
                Err(e) => return Err(AttemptError::Storage(e)),
            }

            attempts_ref.fetch_add(1, Ordering::SeqCst);
            self.log
                .publish(&self.config.topic, &entry.record_id, payload.clone())
                .await
                .map_err(AttemptError::Bus)
        })
        .retry(relay_backoff(&self.config))
        .when(AttemptError::is_transient)
        .notify(|err: &AttemptError, dur: Duration| {
            warn!(
                worker_id = %self.worker_id,
                partition = entry.partition,
                sequence = entry.sequence,
                error = %err,
                delay = ?dur,
                "Publish failed, retrying"
            );
        })
        .await;

        (attempts.load(Ordering::SeqCst), result)
    }

    fn raise_alert(&self, entry: &OutboxEntry, attempts: u32, err: &BusError) {
        let alert = RelayAlert {
            worker_id: self.worker_id.clone(),
            partition: entry.partition,
            sequence: entry.sequence,
            record_id: entry.record_id.clone(),
            attempts,
            error: err.to_string(),
        };

        error!(
            worker_id = %alert.worker_id,
            partition = alert.partition,
            sequence = alert.sequence,
            record_id = %alert.record_id,
            attempts = alert.attempts,
            error = %alert.error,
            "Outbox entry stalled, partition paused"
        );

        // No subscribers is fine; the log line above is the durable signal.
        let _ = self.alerts.send(alert);
    }
}

/// Handle to a spawned relay worker.
pub struct RelayHandle {
    relay: Arc<Relay>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Signal the worker to stop at its next checkpoint.
    pub fn stop(&self) {
        self.relay.stop();
    }

    /// Stop the worker and wait for the current batch to finish.
    pub async fn shutdown(self) {
        self.relay.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Relay task panicked");
        }
    }
}

/// Run `relay` in a background task until stopped.
pub fn spawn(relay: Arc<Relay>) -> RelayHandle {
    let worker = Arc::clone(&relay);
    let mut stop_rx = relay.stop.subscribe();

    let task = tokio::spawn(async move {
        let interval = Duration::from_millis(worker.config.poll_interval_ms);
        info!(worker_id = %worker.worker_id, "Relay worker started");

        while !worker.is_stopping() {
            let idle = match worker.run_cycle().await {
                Ok(report) => report.published() == 0,
                Err(e) => {
                    error!(worker_id = %worker.worker_id, error = %e, "Relay cycle failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        }

        info!(worker_id = %worker.worker_id, "Relay worker stopped");
    });

    RelayHandle { relay, task }
}

/// Start `workers` independent relay workers over the same store.
///
/// Workers coordinate only through partition leases.
pub fn spawn_workers(
    store: Arc<dyn OutboxStore>,
    log: Arc<dyn EventLog>,
    config: RelayConfig,
    workers: usize,
) -> Vec<RelayHandle> {
    let base = config
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("relay-{}", Uuid::new_v4()));

    (0..workers.max(1))
        .map(|i| {
            let config = RelayConfig {
                worker_id: Some(format!("{}-{}", base, i)),
                ..config.clone()
            };
            spawn(Arc::new(Relay::new(
                Arc::clone(&store),
                Arc::clone(&log),
                config,
            )))
        })
        .collect()
}
