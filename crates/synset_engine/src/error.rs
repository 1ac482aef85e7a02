//! Error types for the replication engine.

use synset_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while replicating a set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The shared store rejected a command.
    #[error("store error: {0}")]
    Store(String),

    /// The broadcast channel rejected a publish.
    #[error("publish error: {0}")]
    Publish(String),

    /// The full membership could not be fetched after (re)subscribing.
    #[error("seed load for key {key} failed after {attempts} attempt(s): {message}")]
    SeedLoadFailed {
        /// Store key that was fetched.
        key: String,
        /// Number of fetch attempts made.
        attempts: u32,
        /// Message of the last failure.
        message: String,
    },

    /// Encoding or decoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Not connected to the broker.
    #[error("not connected to broker")]
    NotConnected,
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::Store(_) => true,
            ReplicationError::Publish(_) => true,
            ReplicationError::NotConnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ReplicationError::transport_retryable("connection lost").is_retryable());
        assert!(!ReplicationError::transport_fatal("bad credentials").is_retryable());
        assert!(ReplicationError::Store("LOADING".into()).is_retryable());
        assert!(ReplicationError::NotConnected.is_retryable());
        assert!(!ReplicationError::Protocol(ProtocolError::encoding_failed("x")).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ReplicationError::SeedLoadFailed {
            key: "users".into(),
            attempts: 3,
            message: "timeout".into(),
        };
        let text = err.to_string();
        assert!(text.contains("users"));
        assert!(text.contains("3"));
        assert!(text.contains("timeout"));
    }
}
