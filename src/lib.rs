//! Carga - transactional outbox for dual writes
//!
//! Records are committed to the primary store together with an outbox entry
//! in one transaction. Relay workers lease outbox partitions and publish the
//! entries to an event log in sequence order; sync consumers apply them to
//! secondary stores exactly once per `(record_id, sequence)`.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod idempotency;
pub mod model;
pub mod relay;
pub mod storage;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
