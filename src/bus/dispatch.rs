//! Handler dispatch utilities.
//!
//! Provides the common pattern for dispatching a delivered message to every
//! registered handler and deciding whether its offset may be committed.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, warn};

use super::{BusError, EventHandler, EventMessage};

/// Result of processing a message through handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// All handlers succeeded, safe to acknowledge.
    Success,
    /// One or more handlers failed, the message must be redelivered.
    HandlerFailed,
    /// Message could not be decoded, no retry will help.
    DecodeError,
}

impl DispatchResult {
    /// Returns true if the message should be acknowledged (offset committed).
    ///
    /// Decode errors are acked to prevent infinite redelivery of bad messages.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Success | Self::DecodeError)
    }

    /// Returns true if all handlers succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Dispatch a message to all registered handlers.
///
/// Calls each handler in sequence, logging errors but continuing to
/// subsequent handlers. A handler failure other than `BusError::Decode`
/// makes the whole dispatch `HandlerFailed`.
pub async fn dispatch_to_handlers(
    handlers: &Arc<RwLock<Vec<Box<dyn EventHandler>>>>,
    message: &Arc<EventMessage>,
) -> DispatchResult {
    let handlers_guard = handlers.read().await;
    let mut result = DispatchResult::Success;

    for handler in handlers_guard.iter() {
        match handler.handle(Arc::clone(message)).await {
            Ok(()) => {}
            Err(BusError::Decode(reason)) => {
                warn!(
                    topic = %message.topic,
                    offset = message.offset,
                    %reason,
                    "Undecodable message skipped"
                );
                if result == DispatchResult::Success {
                    result = DispatchResult::DecodeError;
                }
            }
            Err(e) => {
                error!(
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "Handler failed"
                );
                result = DispatchResult::HandlerFailed;
            }
        }
    }

    result
}
