//! Consumer-side deduplication of at-least-once deliveries.
//!
//! The relay may publish an entry more than once (crash between publish and
//! mark, lease takeover). Every delivery carries `(record_id, sequence)`;
//! the guard remembers recently applied keys so a redelivery produces no
//! second side effect.
//!
//! The window is bounded twice: by count (oldest applied key evicted first)
//! and by age (keys older than `ttl` are forgotten). A key is only
//! remembered once its side effect succeeded, so a failed apply can be
//! retried by the next delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::model::EventEnvelope;

/// Deduplication window configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Maximum number of applied keys remembered.
    pub capacity: usize,
    /// How long an applied key is remembered.
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Identity of one outbox entry as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub record_id: String,
    pub sequence: i64,
}

impl DedupKey {
    pub fn new(record_id: impl Into<String>, sequence: i64) -> Self {
        Self {
            record_id: record_id.into(),
            sequence,
        }
    }
}

impl From<&EventEnvelope> for DedupKey {
    fn from(envelope: &EventEnvelope) -> Self {
        Self::new(envelope.record_id.clone(), envelope.sequence)
    }
}

/// Decision returned by `IdempotencyGuard::admit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Never applied: the caller now owns the key and must `complete` or
    /// `abandon` it.
    Fresh,
    /// Already applied inside the window.
    Duplicate,
    /// Another delivery of the same key is being applied right now.
    InFlight,
}

#[derive(Default)]
struct Window {
    applied: HashMap<DedupKey, Instant>,
    order: VecDeque<(DedupKey, Instant)>,
    in_flight: HashSet<DedupKey>,
}

impl Window {
    fn prune(&mut self, now: Instant, ttl: Duration, capacity: usize) {
        while let Some((key, at)) = self.order.front() {
            let expired = now.saturating_duration_since(*at) >= ttl;
            let over = self.applied.len() > capacity;
            if !expired && !over {
                break;
            }
            // A key re-applied after expiry has a newer stamp in `applied`.
            if self.applied.get(key) == Some(at) {
                self.applied.remove(key);
            }
            self.order.pop_front();
        }
    }
}

/// Result of `IdempotencyGuard::apply_once`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome<T> {
    /// The side effect ran and the key is now remembered.
    Applied(T),
    /// Already applied inside the window; nothing ran.
    Duplicate,
    /// Another delivery of the key is running; nothing ran and the key is
    /// not remembered, so this delivery must be retried.
    InFlight,
}

/// Admitted key that is released on drop unless completed.
struct Ticket<'a> {
    guard: &'a IdempotencyGuard,
    key: &'a DedupKey,
    completed: bool,
}

impl Ticket<'_> {
    fn complete(mut self) {
        self.guard.complete(self.key);
        self.completed = true;
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.guard.abandon(self.key);
        }
    }
}

/// Bounded window of applied `(record_id, sequence)` keys.
pub struct IdempotencyGuard {
    capacity: usize,
    ttl: Duration,
    window: Mutex<Window>,
}

impl IdempotencyGuard {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self::with_window(config.capacity, Duration::from_secs(config.ttl_secs))
    }

    pub fn with_window(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            window: Mutex::new(Window::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether a delivery must be applied.
    pub fn admit(&self, key: &DedupKey) -> Admission {
        let mut window = self.lock();
        window.prune(Instant::now(), self.ttl, self.capacity);

        if window.applied.contains_key(key) {
            return Admission::Duplicate;
        }
        if !window.in_flight.insert(key.clone()) {
            return Admission::InFlight;
        }
        Admission::Fresh
    }

    /// Remember `key` as applied.
    pub fn complete(&self, key: &DedupKey) {
        let now = Instant::now();
        let mut window = self.lock();
        window.in_flight.remove(key);
        window.applied.insert(key.clone(), now);
        window.order.push_back((key.clone(), now));
        window.prune(now, self.ttl, self.capacity);
    }

    /// Release an admitted key without remembering it.
    pub fn abandon(&self, key: &DedupKey) {
        self.lock().in_flight.remove(key);
    }

    /// Run `apply` unless `key` was already applied or is being applied.
    ///
    /// The key is remembered only when `apply` succeeds. A failed or
    /// cancelled `apply` releases the key so the next delivery retries it.
    pub async fn apply_once<F, T, E>(&self, key: &DedupKey, apply: F) -> Result<ApplyOutcome<T>, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let ticket = match self.admit(key) {
            Admission::Fresh => Ticket {
                guard: self,
                key,
                completed: false,
            },
            skipped => {
                debug!(
                    record_id = %key.record_id,
                    sequence = key.sequence,
                    admission = ?skipped,
                    "Delivery not applied"
                );
                return Ok(match skipped {
                    Admission::InFlight => ApplyOutcome::InFlight,
                    _ => ApplyOutcome::Duplicate,
                });
            }
        };

        let value = apply.await?;
        ticket.complete();
        Ok(ApplyOutcome::Applied(value))
    }

    /// Whether `key` is currently remembered as applied.
    pub fn contains(&self, key: &DedupKey) -> bool {
        let mut window = self.lock();
        window.prune(Instant::now(), self.ttl, self.capacity);
        window.applied.contains_key(key)
    }

    /// Number of remembered applied keys.
    pub fn len(&self) -> usize {
        self.lock().applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
