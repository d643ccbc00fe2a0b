//! In-memory channel-based event log.
//!
//! Keeps an append-only log per topic (offsets start at 0, single
//! partition) and fans every accepted message out to subscribers over a
//! tokio broadcast channel. Used for local runs and tests without a broker.
//! A message whose handlers fail is redelivered until they accept it.
//!
//! Publish failures can be injected to exercise the relay's retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use super::{BusError, Delivery, EventHandler, EventLog, EventMessage, Result};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// Pause before handing a failed message to the handlers again.
const REDELIVERY_DELAY: Duration = Duration::from_millis(100);

/// In-memory event log using tokio broadcast channels.
pub struct ChannelEventLog {
    /// Broadcast sender for delivering accepted messages.
    sender: broadcast::Sender<Arc<EventMessage>>,
    /// Accepted messages per topic, index == offset.
    topics: RwLock<HashMap<String, Vec<Arc<EventMessage>>>>,
    /// Registered event handlers.
    handlers: Arc<RwLock<Vec<Box<dyn EventHandler>>>>,
    /// Flag indicating if consumer task is running.
    consuming: RwLock<bool>,
    fail_next: AtomicUsize,
    reject_next: AtomicUsize,
    unavailable: AtomicBool,
    publish_attempts: AtomicUsize,
}

impl Default for ChannelEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelEventLog {
    /// Create a new channel event log.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        info!("Channel event log initialized");

        Self {
            sender,
            topics: RwLock::new(HashMap::new()),
            handlers: Arc::new(RwLock::new(Vec::new())),
            consuming: RwLock::new(false),
            fail_next: AtomicUsize::new(0),
            reject_next: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            publish_attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` publishes with a transient `BusError::Publish`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` publishes with a permanent `BusError::Rejected`.
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Make every publish fail with `BusError::Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Publish calls seen so far, including failed ones.
    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Accepted messages on `topic`, in offset order.
    pub async fn messages(&self, topic: &str) -> Vec<Arc<EventMessage>> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected_failure(&self) -> Option<BusError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Some(BusError::Unavailable("channel log unavailable".to_string()));
        }
        if Self::take_one(&self.reject_next) {
            return Some(BusError::Rejected("injected rejection".to_string()));
        }
        if Self::take_one(&self.fail_next) {
            return Some(BusError::Publish("injected publish failure".to_string()));
        }
        None
    }
}

#[async_trait]
impl EventLog for ChannelEventLog {
    #[tracing::instrument(name = "log.publish", skip_all, fields(topic = %topic, key = %key))]
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Delivery> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.injected_failure() {
            debug!(error = %err, "Publish failed");
            return Err(err);
        }

        // Hold the topic lock across the broadcast so subscribers observe
        // messages in offset order.
        let mut topics = self.topics.write().await;
        let log = topics.entry(topic.to_string()).or_default();
        let message = Arc::new(EventMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            partition: 0,
            offset: log.len() as i64,
        });
        log.push(Arc::clone(&message));

        let delivery = Delivery {
            partition: message.partition,
            offset: message.offset,
        };

        match self.sender.send(message) {
            Ok(receivers) => debug!(offset = delivery.offset, receivers, "Published to channel"),
            Err(_) => debug!(offset = delivery.offset, "Published to channel (no receivers)"),
        }

        Ok(delivery)
    }

    async fn subscribe(&self, handler: Box<dyn EventHandler>) -> Result<()> {
        let count = {
            let mut handlers = self.handlers.write().await;
            handlers.push(handler);
            handlers.len()
        };

        info!(handler_count = count, "Handler subscribed to channel log");

        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        {
            let mut consuming = self.consuming.write().await;
            if *consuming {
                return Ok(());
            }
            *consuming = true;
        }

        let mut receiver = self.sender.subscribe();
        let handlers = Arc::clone(&self.handlers);

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        // Redeliver until acked; later messages wait to keep order.
                        while !super::dispatch_to_handlers(&handlers, &message)
                            .await
                            .should_ack()
                        {
                            warn!(
                                topic = %message.topic,
                                offset = message.offset,
                                "Handlers failed, message will be redelivered"
                            );
                            tokio::time::sleep(REDELIVERY_DELAY).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        break;
                    }
                }
            }
        });

        info!("Channel consumer started");

        Ok(())
    }
}

#[cfg(test)]
mod tests;
