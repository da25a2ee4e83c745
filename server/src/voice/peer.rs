//! Room Members
//!
//! A peer is one signaling session's membership in one room: its lifecycle
//! state, media state, registered capabilities and the ids of the engine
//! objects it owns.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use vc_common::protocol::ServerNotification;
use vc_common::{
    ConsumerId, MediaState, PeerId, PeerInfo, ProducerId, RoomId, RtpCapabilities, TrackSource,
    TransportDirection, TransportId,
};

use super::error::VoiceError;
use super::session::Outbox;

/// Lifecycle of a peer inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Joining,
    Joined,
    Leaving,
    Left,
}

impl PeerState {
    /// Whether `self -> next` is a legal step.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Joining)
                | (Self::Joining, Self::Joined)
                | (Self::Joining | Self::Joined, Self::Leaving)
                | (Self::Leaving, Self::Left)
        )
    }
}

#[derive(Debug, Default)]
struct PeerMedia {
    state: MediaState,
    rtp_capabilities: Option<RtpCapabilities>,
    send_transport: Option<TransportId>,
    recv_transport: Option<TransportId>,
    producers: HashMap<TrackSource, ProducerId>,
}

/// A member of a room.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    username: String,
    room_id: RoomId,
    state: Mutex<PeerState>,
    media: Mutex<PeerMedia>,
    /// Held across consume so one producer never gets two consumers.
    consumers: tokio::sync::Mutex<HashMap<ProducerId, ConsumerId>>,
    outbox: Outbox,
    cancel: CancellationToken,
}

impl Peer {
    pub fn new(
        id: PeerId,
        username: String,
        room_id: RoomId,
        outbox: Outbox,
    ) -> Self {
        Self {
            id,
            username,
            room_id,
            state: Mutex::new(PeerState::Idle),
            media: Mutex::new(PeerMedia::default()),
            consumers: tokio::sync::Mutex::new(HashMap::new()),
            outbox,
            cancel: CancellationToken::new(),
        }
    }

    pub const fn id(&self) -> PeerId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn media(&self) -> MutexGuard<'_, PeerMedia> {
        self.media.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, failing on an illegal step.
    pub fn transition(&self, next: PeerState) -> Result<PeerState, VoiceError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *state;
        if !current.can_transition_to(next) {
            return Err(VoiceError::InvalidState(format!(
                "peer cannot go from {current:?} to {next:?}"
            )));
        }
        *state = next;
        Ok(current)
    }

    pub fn is_joined(&self) -> bool {
        self.state() == PeerState::Joined
    }

    /// Fails unless the peer is joined.
    pub fn ensure_joined(&self) -> Result<(), VoiceError> {
        if self.is_joined() {
            Ok(())
        } else {
            Err(VoiceError::InvalidState(format!(
                "peer is {:?}",
                self.state()
            )))
        }
    }

    /// Fires when the peer starts leaving.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.id,
            username: self.username.clone(),
            media_state: self.media_state(),
        }
    }

    pub fn media_state(&self) -> MediaState {
        self.media().state
    }

    /// Apply `f` to the media state and return the result.
    pub fn update_media_state(&self, f: impl FnOnce(&mut MediaState)) -> MediaState {
        let mut media = self.media();
        f(&mut media.state);
        media.state
    }

    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.media().rtp_capabilities.clone()
    }

    pub fn set_rtp_capabilities(&self, capabilities: RtpCapabilities) {
        self.media().rtp_capabilities = Some(capabilities);
    }

    pub fn transport(&self, direction: TransportDirection) -> Option<TransportId> {
        let media = self.media();
        match direction {
            TransportDirection::Send => media.send_transport,
            TransportDirection::Recv => media.recv_transport,
        }
    }

    /// Record the transport for `direction`. Only one per direction.
    pub fn set_transport(
        &self,
        direction: TransportDirection,
        id: TransportId,
    ) -> Result<(), VoiceError> {
        let mut media = self.media();
        let slot = match direction {
            TransportDirection::Send => &mut media.send_transport,
            TransportDirection::Recv => &mut media.recv_transport,
        };
        if slot.is_some() {
            return Err(VoiceError::InvalidState(format!(
                "{direction} transport already exists"
            )));
        }
        *slot = Some(id);
        Ok(())
    }

    /// Forget a closed transport.
    pub fn clear_transport(&self, id: TransportId) {
        let mut media = self.media();
        if media.send_transport == Some(id) {
            media.send_transport = None;
        }
        if media.recv_transport == Some(id) {
            media.recv_transport = None;
        }
    }

    /// Whether `id` is one of this peer's transports.
    pub fn owns_transport(&self, id: TransportId) -> bool {
        let media = self.media();
        media.send_transport == Some(id) || media.recv_transport == Some(id)
    }

    pub fn producer(&self, source: TrackSource) -> Option<ProducerId> {
        self.media().producers.get(&source).copied()
    }

    /// Source of one of this peer's producers.
    pub fn producer_source(&self, id: ProducerId) -> Option<TrackSource> {
        self.media()
            .producers
            .iter()
            .find_map(|(source, producer)| (*producer == id).then_some(*source))
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.media().producers.values().copied().collect()
    }

    /// Record a producer. Fails if the source already has one.
    pub fn add_producer(&self, source: TrackSource, id: ProducerId) -> Result<(), VoiceError> {
        let mut media = self.media();
        if media.producers.contains_key(&source) {
            return Err(VoiceError::Produce(format!(
                "a {source:?} producer is already live"
            )));
        }
        media.producers.insert(source, id);
        Self::sync_flags(&mut media);
        Ok(())
    }

    /// Forget a producer. Returns its source and the new media state.
    pub fn remove_producer(&self, id: ProducerId) -> Option<(TrackSource, MediaState)> {
        let mut media = self.media();
        let source = media
            .producers
            .iter()
            .find_map(|(source, producer)| (*producer == id).then_some(*source))?;
        media.producers.remove(&source);
        Self::sync_flags(&mut media);
        Some((source, media.state))
    }

    fn sync_flags(media: &mut PeerMedia) {
        media.state.screen_sharing = media.producers.contains_key(&TrackSource::ScreenVideo);
        media.state.video_enabled = media.producers.contains_key(&TrackSource::Camera);
    }

    pub const fn consumers(&self) -> &tokio::sync::Mutex<HashMap<ProducerId, ConsumerId>> {
        &self.consumers
    }

    /// Queue a notification. A full queue closes the owning session.
    pub fn notify(&self, notification: ServerNotification) -> bool {
        self.outbox.notify(self.id, notification)
    }
}
