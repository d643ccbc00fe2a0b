//! Kafka event log implementation.
//!
//! Records are published to a single topic keyed by record id, so every
//! version of a record lands in the same Kafka partition.
//! Delivery confirmation is the broker-assigned `(partition, offset)`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{BusError, Delivery, EventHandler, EventLog, EventMessage, Result};
use crate::config::KafkaConfig;

/// Pause before re-reading a message whose handlers failed.
const REDELIVERY_DELAY: Duration = Duration::from_millis(500);

/// Configuration for Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaEventLogConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Consumer group ID (required for subscribing).
    pub group_id: Option<String>,
    /// Topics to subscribe to (for consumers).
    pub topics: Vec<String>,
    /// Producer delivery timeout.
    pub delivery_timeout_ms: u64,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl KafkaEventLogConfig {
    /// Create config for publishing only.
    pub fn publisher(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: None,
            topics: Vec::new(),
            delivery_timeout_ms: 5000,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }

    /// Create config for a consumer group member.
    pub fn subscriber(
        bootstrap_servers: impl Into<String>,
        group_id: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            group_id: Some(group_id.into()),
            topics,
            ..Self::publisher(bootstrap_servers)
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub fn with_delivery_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.delivery_timeout_ms = timeout_ms;
        self
    }

    /// Apply the security settings from the messaging configuration.
    pub fn with_security(mut self, kafka: &KafkaConfig) -> Self {
        if let (Some(user), Some(pass), Some(mechanism)) = (
            &kafka.sasl_username,
            &kafka.sasl_password,
            &kafka.sasl_mechanism,
        ) {
            self = self.with_sasl(user, pass, mechanism);
        }

        if let Some(ref protocol) = kafka.security_protocol {
            self = self.with_security_protocol(protocol);
        }

        if let Some(ref ca) = kafka.ssl_ca_location {
            self = self.with_ssl_ca(ca);
        }

        self
    }

    /// Build a ClientConfig for producers.
    ///
    /// `acks=all` plus idempotence: a confirmed send is durable and broker
    /// retries never duplicate or reorder messages within a partition.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", self.delivery_timeout_ms.to_string());
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for consumers.
    fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");

        if let Some(ref group_id) = self.group_id {
            config.set("group.id", group_id);
        }

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

/// Map a producer error onto the transient/permanent split the relay uses.
pub(crate) fn classify_publish_error(err: &KafkaError) -> BusError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition,
        ) => BusError::Rejected(err.to_string()),
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::LeaderNotAvailable,
        ) => BusError::Unavailable(err.to_string()),
        _ => BusError::Publish(err.to_string()),
    }
}

/// Kafka event log implementation.
///
/// Subscribers use consumer groups; offsets are committed only after every
/// handler accepted the message, so a crash between apply and commit
/// redelivers instead of losing.
pub struct KafkaEventLog {
    producer: FutureProducer,
    config: KafkaEventLogConfig,
    handlers: Arc<RwLock<Vec<Box<dyn EventHandler>>>>,
    consumer: Option<Arc<StreamConsumer>>,
}

impl KafkaEventLog {
    /// Create a new Kafka event log.
    pub async fn new(config: KafkaEventLogConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "Connected to Kafka"
        );

        let consumer = if config.group_id.is_some() {
            let consumer: StreamConsumer =
                config.build_consumer_config().create().map_err(|e| {
                    BusError::Connection(format!("Failed to create Kafka consumer: {}", e))
                })?;
            Some(Arc::new(consumer))
        } else {
            None
        };

        Ok(Self {
            producer,
            config,
            handlers: Arc::new(RwLock::new(Vec::new())),
            consumer,
        })
    }
}

#[async_trait]
impl EventLog for KafkaEventLog {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Delivery> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        let (partition, offset) = self
            .producer
            .send(
                record,
                Duration::from_millis(self.config.delivery_timeout_ms),
            )
            .await
            .map_err(|(e, _)| classify_publish_error(&e))?;

        debug!(
            topic = %topic,
            key = %key,
            partition,
            offset,
            "Published to Kafka"
        );

        Ok(Delivery { partition, offset })
    }

    async fn subscribe(&self, handler: Box<dyn EventHandler>) -> Result<()> {
        if self.consumer.is_none() {
            return Err(BusError::Subscribe(
                "Cannot subscribe: no consumer configured. Use KafkaEventLogConfig::subscriber()"
                    .to_string(),
            ));
        }

        let mut handlers = self.handlers.write().await;
        handlers.push(handler);

        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| {
                BusError::Subscribe(
                    "No consumer configured. Use KafkaEventLogConfig::subscriber()".to_string(),
                )
            })?
            .clone();

        let topic_refs: Vec<&str> = self.config.topics.iter().map(|s| s.as_str()).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to topics: {}", e)))?;

        info!(topics = ?self.config.topics, "Subscribed to Kafka topics");

        let handlers = self.handlers.clone();

        tokio::spawn(async move {
            use futures::StreamExt;
            use rdkafka::message::Message as KafkaMessage;

            let mut stream = consumer.stream();

            while let Some(result) = stream.next().await {
                let message = match result {
                    Ok(message) => message,
                    Err(e) => {
                        error!(error = %e, "Kafka consumer error");
                        continue;
                    }
                };

                let event = Arc::new(EventMessage {
                    topic: message.topic().to_string(),
                    key: message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .unwrap_or_default(),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    partition: message.partition(),
                    offset: message.offset(),
                });

                debug!(
                    topic = %event.topic,
                    partition = event.partition,
                    offset = event.offset,
                    "Received message"
                );

                let result = super::dispatch_to_handlers(&handlers, &event).await;

                if result.should_ack() {
                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        error!(error = %e, "Failed to commit offset");
                    }
                    continue;
                }

                // Rewind so the failed message is delivered again.
                warn!(
                    topic = %event.topic,
                    partition = event.partition,
                    offset = event.offset,
                    "Handlers failed, message will be redelivered"
                );
                tokio::time::sleep(REDELIVERY_DELAY).await;
                if let Err(e) = consumer.seek(
                    &event.topic,
                    event.partition,
                    Offset::Offset(event.offset),
                    Duration::from_secs(5),
                ) {
                    error!(error = %e, "Failed to rewind partition");
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests;
