//! Session Errors

use thiserror::Error;
use vc_common::protocol::{ErrorCode, ErrorPayload};
use vc_common::TrackSource;

/// Errors surfaced by the session controller and the mesh call path.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Router and local capabilities share no codec.
    #[error("Failed to load device capabilities: {0}")]
    CapabilityLoadFailure(String),

    #[error("Failed to create transport: {0}")]
    TransportCreationFailure(String),

    #[error("Failed to connect transport: {0}")]
    TransportConnectFailure(String),

    #[error("Failed to produce: {0}")]
    ProduceFailure(String),

    #[error("Failed to consume: {0}")]
    ConsumeFailure(String),

    /// Capture permission refused or device missing.
    #[error("Access to {track:?} denied: {message}")]
    LocalMediaDenied {
        /// Source that could not be captured.
        track: TrackSource,
        /// Message from the capture backend.
        message: String,
    },

    #[error("ICE failure: {0}")]
    IceFailure(String),

    /// Server refused a request with a code outside the taxonomy above.
    #[error("Signaling error ({code}): {message}")]
    Signaling { code: ErrorCode, message: String },

    /// No acknowledgment before the deadline.
    #[error("Timed out waiting for '{event}' acknowledgment")]
    Timeout { event: &'static str },

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Already joined to a room")]
    AlreadyJoined,

    #[error("Screen share is not active")]
    ScreenShareInactive,

    /// Signaling connection is gone.
    #[error("Disconnected from signaling server")]
    Disconnected,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error(transparent)]
    Protocol(#[from] vc_common::Error),
}

impl SessionError {
    /// Map a failed acknowledgment back onto the client taxonomy.
    pub fn from_ack(error: ErrorPayload) -> Self {
        let ErrorPayload { code, message } = error;
        match code {
            ErrorCode::CapabilityLoadFailure | ErrorCode::CapabilitiesNotRegistered => {
                Self::CapabilityLoadFailure(message)
            }
            ErrorCode::TransportCreationFailure => Self::TransportCreationFailure(message),
            ErrorCode::TransportConnectFailure | ErrorCode::TransportNotReady => {
                Self::TransportConnectFailure(message)
            }
            ErrorCode::ProduceFailure => Self::ProduceFailure(message),
            ErrorCode::ConsumeFailure => Self::ConsumeFailure(message),
            ErrorCode::IceFailure => Self::IceFailure(message),
            ErrorCode::NotInRoom => Self::NotJoined,
            ErrorCode::AlreadyJoined => Self::AlreadyJoined,
            code => Self::Signaling { code, message },
        }
    }

    /// Wire code for errors that came from the server.
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Signaling { code, .. } => Some(*code),
            _ => None,
        }
    }
}
