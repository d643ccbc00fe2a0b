//! Event log for relayed records.
//!
//! This module contains:
//! - `EventLog` trait: durable, partitioned, keyed publication with delivery
//!   confirmation, plus consumer-side subscription
//! - `EventHandler` trait: for processing delivered messages
//! - Implementations: in-process channel log, Kafka

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};

pub mod channel;
pub mod dispatch;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use channel::ChannelEventLog;
pub use dispatch::{dispatch_to_handlers, DispatchResult};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaEventLog, KafkaEventLogConfig};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

impl BusError {
    /// Whether retrying the same publish can succeed.
    ///
    /// `Rejected` covers messages the log will never accept (oversized,
    /// unauthorized topic); retrying them only delays the stall.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Connection(_) | BusError::Unavailable(_) | BusError::Publish(_)
        )
    }
}

/// Confirmation that the log durably accepted a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A message as delivered to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// Handler for processing messages from the log.
pub trait EventHandler: Send + Sync {
    /// Process one delivered message.
    fn handle(
        &self,
        message: Arc<EventMessage>,
    ) -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

/// Interface to the downstream event log.
///
/// Implementations:
/// - `ChannelEventLog`: in-process log for tests and single-node runs
/// - `KafkaEventLog`: Kafka via rdkafka (feature `kafka`)
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Publish `payload` under `key`.
    ///
    /// Returns only after the log confirmed the write. Messages sharing a
    /// key land in the same log partition, preserving their order.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Delivery>;

    /// Register a handler for delivered messages.
    async fn subscribe(&self, handler: Box<dyn EventHandler>) -> Result<()>;

    /// Start delivering messages to subscribed handlers (call after subscribe).
    async fn start_consuming(&self) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Mode for event log initialization.
#[derive(Debug, Clone)]
pub enum EventLogMode {
    /// Publisher-only mode (relay workers).
    Publisher,
    /// Consumer group member (sync consumers).
    Subscriber {
        /// Consumer group id.
        group_id: String,
    },
}

/// Initialize the event log based on configuration.
///
/// Kafka requires the `kafka` feature.
pub async fn init_event_log(
    config: &MessagingConfig,
    mode: EventLogMode,
) -> std::result::Result<Arc<dyn EventLog>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            let log = ChannelEventLog::new();
            info!(messaging_type = "channel", mode = ?mode, "Event log initialized");
            Ok(Arc::new(log))
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let kafka_config = match mode {
                    EventLogMode::Publisher => {
                        KafkaEventLogConfig::publisher(&config.kafka.bootstrap_servers)
                    }
                    EventLogMode::Subscriber { group_id } => KafkaEventLogConfig::subscriber(
                        &config.kafka.bootstrap_servers,
                        group_id,
                        vec![config.topic.clone()],
                    ),
                };
                let kafka_config = kafka_config
                    .with_delivery_timeout_ms(config.kafka.delivery_timeout_ms)
                    .with_security(&config.kafka);

                let log = KafkaEventLog::new(kafka_config).await?;
                info!(messaging_type = "kafka", "Event log initialized");
                Ok(Arc::new(log))
            }

            #[cfg(not(feature = "kafka"))]
            {
                let _ = mode;
                Err("Kafka support requires the 'kafka' feature. Rebuild with --features kafka".into())
            }
        }
    }
}
