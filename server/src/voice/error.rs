//! Voice Service Errors

use thiserror::Error;
use vc_common::protocol::ErrorCode;
use vc_common::{CallId, ProducerId, RoomId};

use super::call::CallStateError;
use crate::engine::EngineError;

/// Errors returned to clients in signaling acknowledgments.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Router capabilities and client capabilities share no codec.
    #[error("Capability negotiation failed: {0}")]
    CapabilityLoadFailure(String),

    /// Consume attempted before `register-capabilities`.
    #[error("RTP capabilities not registered")]
    CapabilitiesNotRegistered,

    #[error("Failed to create transport: {0}")]
    TransportCreation(#[source] EngineError),

    #[error("Failed to connect transport: {0}")]
    TransportConnect(#[source] EngineError),

    /// Receive transport missing or not connected.
    #[error("Receive transport is not connected")]
    TransportNotReady,

    #[error("Failed to produce: {0}")]
    Produce(String),

    #[error("Cannot consume producer {producer_id}: {reason}")]
    Consume {
        /// Producer requested.
        producer_id: ProducerId,
        /// Why it was refused.
        reason: String,
    },

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Not in the room named by the request.
    #[error("Not in room {0}")]
    NotInRoom(RoomId),

    /// Already in a room.
    #[error("Already joined room {0}")]
    AlreadyJoined(RoomId),

    /// Room is at capacity.
    #[error("Room is full (max: {max_peers})")]
    RoomFull {
        /// Maximum allowed peers.
        max_peers: usize,
    },

    /// Request not valid in the peer's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Rate limited.
    #[error("Rate limited: too many join requests")]
    RateLimited,

    /// Request did not finish in time.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Call already exists: {0}")]
    CallAlreadyExists(CallId),

    #[error("Not in call {0}")]
    NotInCall(CallId),

    /// Malformed or semantically invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Engine failure not tied to a specific step.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VoiceError {
    /// Stable wire code for the acknowledgment.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::CapabilityLoadFailure(_) => ErrorCode::CapabilityLoadFailure,
            Self::CapabilitiesNotRegistered => ErrorCode::CapabilitiesNotRegistered,
            Self::TransportCreation(_) => ErrorCode::TransportCreationFailure,
            Self::TransportConnect(_) => ErrorCode::TransportConnectFailure,
            Self::TransportNotReady => ErrorCode::TransportNotReady,
            Self::Produce(_) => ErrorCode::ProduceFailure,
            Self::Consume { .. } => ErrorCode::ConsumeFailure,
            Self::RoomNotFound(_) => ErrorCode::RoomNotFound,
            Self::NotInRoom(_) => ErrorCode::NotInRoom,
            Self::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            Self::RoomFull { .. } => ErrorCode::RoomFull,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::CallNotFound(_) => ErrorCode::CallNotFound,
            Self::CallAlreadyExists(_) => ErrorCode::CallAlreadyExists,
            Self::NotInCall(_) => ErrorCode::NotInCall,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Engine(err) => match err {
                EngineError::TransportNotFound(_)
                | EngineError::ProducerNotFound(_)
                | EngineError::ConsumerNotFound(_) => ErrorCode::InvalidRequest,
                _ => ErrorCode::InternalError,
            },
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to send to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<CallStateError> for VoiceError {
    fn from(err: CallStateError) -> Self {
        Self::InvalidState(err.to_string())
    }
}

impl From<vc_common::Error> for VoiceError {
    fn from(err: vc_common::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
