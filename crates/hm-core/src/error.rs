use std::time::Duration;

use thiserror::Error;

/// Whether a storage failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorClass {
    Transient,
    Permanent,
}

/// The error set surfaced by every public HeroMessaging operation.
#[derive(Debug, Error)]
pub enum HeroError {
    #[error("no handler registered for message type '{0}'")]
    HandlerNotFound(String),

    #[error("handler error: {source}")]
    Handler {
        #[source]
        source: anyhow::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("serialization version mismatch: {0}")]
    SerializationVersion(String),

    #[error("storage error: {message}")]
    Storage {
        class: StorageErrorClass,
        message: String,
    },

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue '{0}' is full")]
    QueueFull(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl HeroError {
    pub fn handler(source: impl Into<anyhow::Error>) -> Self {
        HeroError::Handler {
            source: source.into(),
        }
    }

    pub fn storage_transient(message: impl Into<String>) -> Self {
        HeroError::Storage {
            class: StorageErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn storage_permanent(message: impl Into<String>) -> Self {
        HeroError::Storage {
            class: StorageErrorClass::Permanent,
            message: message.into(),
        }
    }

    /// Classify this error as retry-eligible.
    ///
    /// The transient set is closed: timeouts, transient storage failures,
    /// and driver errors whose message mentions "timeout" or "connection"
    /// (case-insensitive). Cancellation, validation, configuration and
    /// missing-handler errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            HeroError::Timeout(_) => true,
            HeroError::Storage { class, .. } => *class == StorageErrorClass::Transient,
            HeroError::Handler { source } => {
                let message = source.to_string().to_ascii_lowercase();
                message.contains("timeout") || message.contains("connection")
            }
            HeroError::Cancelled
            | HeroError::Validation(_)
            | HeroError::Configuration(_)
            | HeroError::HandlerNotFound(_)
            | HeroError::CircuitOpen
            | HeroError::ConcurrencyConflict(_)
            | HeroError::QueueFull(_)
            | HeroError::Serialization(_)
            | HeroError::SerializationVersion(_) => false,
        }
    }

    /// Whether a failure with this error is deterministic enough to cache
    /// for idempotent replay. Timeouts and other transient failures are
    /// excluded; the same call may well succeed next time.
    pub fn is_idempotent_failure(&self) -> bool {
        matches!(
            self,
            HeroError::Validation(_)
                | HeroError::Configuration(_)
                | HeroError::HandlerNotFound(_)
                | HeroError::SerializationVersion(_)
        )
    }

    /// Cancellation and configuration errors abort the current call
    /// unconditionally; nothing downstream should retry or intercept them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HeroError::Cancelled | HeroError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        assert!(HeroError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn handler_error_message_substring_classification() {
        let transient = HeroError::handler(anyhow::anyhow!("Connection refused by peer"));
        assert!(transient.is_transient());

        let permanent = HeroError::handler(anyhow::anyhow!("invalid order total"));
        assert!(!permanent.is_transient());
    }

    #[test]
    fn cancellation_is_never_transient_nor_cacheable() {
        assert!(!HeroError::Cancelled.is_transient());
        assert!(!HeroError::Cancelled.is_idempotent_failure());
        assert!(HeroError::Cancelled.is_fatal());
    }

    #[test]
    fn validation_is_cacheable_not_transient() {
        let err = HeroError::Validation("total must be positive".into());
        assert!(err.is_idempotent_failure());
        assert!(!err.is_transient());
    }

    #[test]
    fn storage_class_drives_transience() {
        assert!(HeroError::storage_transient("socket reset").is_transient());
        assert!(!HeroError::storage_permanent("constraint violation").is_transient());
    }
}
