//! Voice Service
//!
//! Rooms, peers and mesh calls on top of the media engine.
//!
//! Signaling runs over WebSocket (see ws/mod.rs). This module provides:
//! - the signaling service executing room and call requests
//! - room membership and announcement ordering
//! - the room to router registry
//! - mesh call state and relaying
//! - HTTP endpoints for ICE server configuration

pub mod call;
pub mod call_service;
pub mod error;
mod handlers;
pub mod peer;
mod rate_limit;
pub mod registry;
pub mod room;
pub mod session;
pub mod signaling;

use axum::routing::get;
use axum::Router;

// Re-exports
pub use call::{CallEventType, CallState, CallStateError};
pub use call_service::CallService;
pub use error::VoiceError;
pub use handlers::{IceServersResponse, VoiceStatus};
pub use peer::{Peer, PeerState};
pub use rate_limit::JoinThrottle;
pub use registry::RouterRegistry;
pub use room::Room;
pub use session::{Outbox, Session, SessionRegistry, SESSION_CHANNEL_CAPACITY};
pub use signaling::SignalingService;

use crate::api::AppState;

/// Create voice router.
///
/// Note: Room and call requests are handled via WebSocket.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ice-servers", get(handlers::get_ice_servers))
        .route("/status", get(handlers::get_status))
}
