//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or recognizing operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a value or an operation record.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// The payload decoded but is not shaped like an operation record.
    #[error("invalid operation structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// The discriminator tag is not one of the known operation kinds.
    #[error("unknown operation tag: {tag}")]
    UnknownTag {
        /// The tag that was found.
        tag: String,
    },

    /// An embedded value failed the configured validity check.
    #[error("value rejected: {reason}")]
    RejectedValue {
        /// Why the value was rejected.
        reason: String,
    },
}

impl ProtocolError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Create a rejected value error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::RejectedValue {
            reason: reason.into(),
        }
    }
}
