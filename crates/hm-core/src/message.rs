//! Message marker traits and routing kinds.
//!
//! Handlers are looked up by the concrete payload type, so every message
//! carries a stable type name used for diagnostics and wire routing.

use serde::{Deserialize, Serialize};

/// How the dispatcher routes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Command,
    Query,
    Event,
    QueueMessage,
    ScheduledMessage,
}

/// Base trait for anything that can flow through the pipeline.
pub trait Message: Send + Sync + 'static {
    /// Stable type name used in logs, metrics and the transport envelope.
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// A request for exactly one handler to mutate state. No return value.
pub trait Command: Message {}

/// A request for exactly one handler to produce a response.
pub trait Query: Message {
    type Response: Send + Sync + 'static;
}

/// A fact, fanned out to every registered handler.
pub trait Event: Message {}
