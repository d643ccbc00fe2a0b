//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides the relay's
//! publish backoff and the startup connection backoff.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::relay::RelayConfig;

/// Backoff for relay publish retries on transient event log errors.
///
/// Delays start at `retry_min_delay_ms`, double per attempt up to
/// `retry_max_delay_ms`, and stop after `max_retries` retries.
/// Jitter enabled.
pub fn relay_backoff(config: &RelayConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.retry_min_delay_ms))
        .with_max_delay(Duration::from_millis(config.retry_max_delay_ms))
        .with_max_times(config.max_retries)
        .with_jitter()
}

/// Backoff for connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
