//! Error types for eventstream

use thiserror::Error;

/// Errors that can occur while publishing or consuming events
#[derive(Debug, Error)]
pub enum EventError {
    /// Unsupported backend, malformed security settings, missing feature
    #[error("Configuration error: {0}")]
    Config(String),

    /// A builder failed field validation; nothing was sent
    #[error("Validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Synchronous publish was not acknowledged within the publish timeout
    #[error("Publish to topic '{topic}' not acknowledged within {timeout_ms}ms")]
    PublishTimeout { topic: String, timeout_ms: u64 },

    /// Any other bounded wait (metadata query) expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The transport rejected or could not deliver a message
    #[error("Transport error on topic '{topic}': {reason}")]
    Transport {
        topic: String,
        reason: String,
        /// Whether resending the same message may succeed
        retriable: bool,
    },

    /// A subscriber callback returned an error or panicked
    #[error("Processing error: {0}")]
    Processing(String),

    /// Message body is not a valid event
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The caller's cancellation token fired before the operation finished
    #[error("Operation cancelled")]
    Cancelled,

    /// A subscription with the same slug is already running on this client
    #[error("Subscription already registered: {0}")]
    AlreadyRegistered(String),

    /// Topic or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl EventError {
    /// Shorthand for a validation failure on `field`
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport { retriable: true, .. })
    }
}

/// Result type alias for event operations
pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = EventError::validation("category", "required");
        assert_eq!(err.to_string(), "Validation failed for 'category': required");
    }

    #[test]
    fn test_retriable_only_for_transient_transport() {
        let transient = EventError::Transport {
            topic: "orders".into(),
            reason: "queue full".into(),
            retriable: true,
        };
        let permanent = EventError::Transport {
            topic: "orders".into(),
            reason: "message too large".into(),
            retriable: false,
        };
        assert!(transient.is_retriable());
        assert!(!permanent.is_retriable());
        assert!(!EventError::Cancelled.is_retriable());
    }
}
