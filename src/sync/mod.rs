//! Replica synchronization consumer.
//!
//! `SyncHandler` decodes relayed `EventEnvelope`s and upserts their records
//! into a `RecordSink`, consulting the idempotency guard so that
//! redeliveries of the same `(record_id, sequence)` are applied once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info};

use crate::bus::{BusError, EventHandler, EventMessage};
use crate::idempotency::{ApplyOutcome, DedupKey, IdempotencyGuard};
use crate::model::EventEnvelope;
use crate::storage::RecordSink;

/// Sync consumer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Replica database the consumer applies records into.
    pub replica_path: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            replica_path: "./data/replica.db".to_string(),
        }
    }
}

#[derive(Default)]
struct SyncCounters {
    applied: AtomicU64,
    skipped: AtomicU64,
}

/// Applies relayed records to a replica exactly once per outbox entry.
#[derive(Clone)]
pub struct SyncHandler {
    sink: Arc<dyn RecordSink>,
    guard: Arc<IdempotencyGuard>,
    counters: Arc<SyncCounters>,
}

impl SyncHandler {
    pub fn new(sink: Arc<dyn RecordSink>, guard: Arc<IdempotencyGuard>) -> Self {
        Self {
            sink,
            guard,
            counters: Arc::new(SyncCounters::default()),
        }
    }

    /// Deliveries that produced a side effect.
    pub fn applied(&self) -> u64 {
        self.counters.applied.load(Ordering::SeqCst)
    }

    /// Deliveries discarded as duplicates.
    pub fn skipped(&self) -> u64 {
        self.counters.skipped.load(Ordering::SeqCst)
    }
}

impl EventHandler for SyncHandler {
    fn handle(&self, message: Arc<EventMessage>) -> BoxFuture<'static, Result<(), BusError>> {
        let sink = Arc::clone(&self.sink);
        let guard = Arc::clone(&self.guard);
        let counters = Arc::clone(&self.counters);

        Box::pin(async move {
            let envelope = EventEnvelope::decode(&message.payload)
                .map_err(|e| BusError::Decode(format!("offset {}: {}", message.offset, e)))?;
            let key = DedupKey::from(&envelope);

            let outcome = guard
                .apply_once(&key, sink.apply(&envelope.record))
                .await
                .map_err(|e| BusError::Unavailable(format!("replica apply failed: {}", e)))?;

            match outcome {
                ApplyOutcome::Applied(()) => {
                    counters.applied.fetch_add(1, Ordering::SeqCst);
                    info!(
                        record_id = %envelope.record_id,
                        sequence = envelope.sequence,
                        "Record synchronized"
                    );
                }
                ApplyOutcome::Duplicate => {
                    counters.skipped.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        record_id = %envelope.record_id,
                        sequence = envelope.sequence,
                        "Duplicate delivery discarded"
                    );
                }
                // Not acked: the running delivery may still fail.
                ApplyOutcome::InFlight => {
                    return Err(BusError::Unavailable(format!(
                        "delivery of {}@{} already in progress",
                        envelope.record_id, envelope.sequence
                    )));
                }
            }

            Ok(())
        })
    }
}
