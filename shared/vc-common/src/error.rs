//! Protocol Errors

use thiserror::Error;

/// Errors raised while encoding or decoding signaling frames.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame is not valid JSON or lacks the envelope fields.
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Event name is known but the payload does not fit it, or the event is unknown.
    #[error("Invalid request '{event}': {reason}")]
    InvalidRequest {
        /// Event name as sent by the peer.
        event: String,
        /// Decoder message.
        reason: String,
    },

    /// Serialization failure.
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
