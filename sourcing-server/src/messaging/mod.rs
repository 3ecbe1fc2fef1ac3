//! Event channel plumbing.
//!
//! Transition messages are published to one queue per message type. A
//! consumer pulls envelopes from a queue and hands them to the handler bound
//! to the envelope's message type. Malformed envelopes are dead-lettered on
//! the spot; transient failures are redelivered until the delivery threshold
//! is reached and then dead-lettered too.

mod broker;
mod consumer;

pub use broker::InMemoryBroker;
pub use consumer::{Consumer, DeliveryOutcome};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sourcing_core::Envelope;
use thiserror::Error;

/// Why a handler could not process a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Unknown message type or undecodable payload. Never redelivered.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A dependency failed. The channel redelivers.
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Errors from publishing to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("failed to publish to {queue}: {message}")]
    Publish { queue: String, message: String },
}

/// Publisher side of the event channel.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), ChannelError>;
}

/// A handler bound to one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// An envelope the channel gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub queue: String,
    pub envelope: Envelope,
    pub reason: String,
    /// Delivery attempts made before giving up.
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Routes envelopes to the handler bound to their message type.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `message_type`, replacing any earlier binding.
    pub fn bind(mut self, message_type: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(message_type.to_string(), handler);
        self
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match self.handlers.get(&envelope.message_type) {
            Some(handler) => handler.handle(envelope).await,
            None => Err(HandlerError::Malformed(format!(
                "unknown message type '{}'",
                envelope.message_type
            ))),
        }
    }
}
