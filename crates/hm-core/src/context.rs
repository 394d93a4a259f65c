//! Explicit processing context.
//!
//! The context replaces ambient task-local state: every public operation
//! takes a `ProcessingContext`, and entering a handler derives a child
//! context scoped to the message being processed. Because contexts are
//! plain values, the "stack" restores itself on every exit path.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::HeroError;

#[derive(Debug, Clone, Default)]
pub struct ProcessingContext {
    correlation_id: Option<String>,
    current_message_id: Option<Uuid>,
    cancellation: CancellationToken,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Derive the context for a handler invoked with `envelope`'s message.
    ///
    /// The child inherits cancellation, takes the envelope's correlation id
    /// (falling back to the parent's), and records the message id so that
    /// anything published within the handler scope is stamped as caused by
    /// this message.
    pub fn child(&self, envelope: &Envelope) -> Self {
        Self {
            correlation_id: envelope
                .correlation_id
                .clone()
                .or_else(|| self.correlation_id.clone()),
            current_message_id: Some(envelope.message_id()),
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Stamp causation and correlation onto an outbound envelope.
    ///
    /// Explicitly set values win; only missing fields are filled in.
    pub fn stamp(&self, envelope: &mut Envelope) {
        if envelope.causation_id.is_none() {
            if let Some(id) = self.current_message_id {
                envelope.causation_id = Some(id.to_string());
            }
        }
        if envelope.correlation_id.is_none() {
            envelope.correlation_id = self.correlation_id.clone();
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn current_message_id(&self) -> Option<Uuid> {
        self.current_message_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fail fast with `Cancelled` if the token has fired.
    pub fn ensure_active(&self) -> Result<(), HeroError> {
        if self.cancellation.is_cancelled() {
            Err(HeroError::Cancelled)
        } else {
            Ok(())
        }
    }
}
