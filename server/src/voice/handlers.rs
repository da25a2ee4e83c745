//! Voice HTTP Handlers
//!
//! HTTP endpoints for voice-related operations.
//! Room and call signaling is handled via WebSocket.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use vc_common::IceServer;

use crate::api::AppState;

/// Response containing ICE server configuration.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServersResponse {
    /// List of ICE servers to use for WebRTC.
    pub ice_servers: Vec<IceServer>,
}

/// Get ICE server configuration.
///
/// GET /api/voice/ice-servers
///
/// Returns STUN and TURN server configuration for WebRTC connections.
/// Mesh calls use these directly; SFU transports receive the same list.
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.ice_servers(),
    })
}

/// Live room, router and call counts.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStatus {
    pub rooms: usize,
    pub routers: usize,
    pub sessions: usize,
    pub active_calls: usize,
    pub workers: usize,
}

/// GET /api/voice/status
pub async fn get_status(State(state): State<AppState>) -> Json<VoiceStatus> {
    let signaling = &state.signaling;
    Json(VoiceStatus {
        rooms: signaling.room_count(),
        routers: signaling.registry().len(),
        sessions: signaling.sessions().len(),
        active_calls: signaling.calls().active_calls(),
        workers: signaling
            .registry()
            .pool()
            .workers()
            .iter()
            .filter(|worker| !worker.is_closed())
            .count(),
    })
}
