//! Room member and producer descriptions.

use serde::{Deserialize, Serialize};

use super::{AppData, MediaKind, PeerId, ProducerId, TrackSource};

/// Media sub-state of a room member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    /// Microphone producer paused (or absent).
    pub muted: bool,
    /// All incoming audio silenced locally.
    pub deafened: bool,
    /// Screen video producer live.
    pub screen_sharing: bool,
    /// Camera producer live.
    pub video_enabled: bool,
}

/// Public information about a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer ID.
    pub peer_id: PeerId,
    /// Display name supplied at connect time.
    pub username: String,
    /// Current media state.
    #[serde(default)]
    pub media_state: MediaState,
}

/// A live producer as announced to other room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    /// Producer ID.
    pub producer_id: ProducerId,
    /// Owner of the producer.
    pub peer_id: PeerId,
    /// Audio or video.
    pub kind: MediaKind,
    /// Where the media comes from.
    pub source: TrackSource,
    /// Application data passed at produce time.
    #[serde(default)]
    pub app_data: AppData,
    /// Whether the producer is currently paused.
    #[serde(default)]
    pub paused: bool,
}
