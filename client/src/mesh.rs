//! Mesh Calls
//!
//! Direct 1:1 (or small group) calls: one `RTCPeerConnection` per remote
//! participant and no router in between. The server only relays offers,
//! answers and ICE candidates between call members. Whoever joins a call
//! makes the offers to the members already in it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vc_common::protocol::{
    CallIceCandidate, CallJoinResponse, CallRef, CallSessionDescription, CallStart,
    CallStartResponse, ClientRequest, ErrorCode, ServerNotification,
};
use vc_common::{CallEndReason, CallId, IceCandidateInit, IceServer, MediaKind, PeerId};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;
use crate::media::{codec_capability, LocalTrack};
use crate::signaling::{decode, SignalingChannel};
use crate::{MediaSession, Topology};

/// Buffered call events per subscriber.
pub const MESH_EVENT_CAPACITY: usize = 64;

/// Events of one mesh call.
#[derive(Clone)]
pub enum MeshEvent {
    ParticipantJoined {
        peer_id: PeerId,
        username: String,
    },
    ParticipantLeft {
        peer_id: PeerId,
    },
    Declined {
        peer_id: PeerId,
    },
    RemoteTrack {
        peer_id: PeerId,
        track: Arc<TrackRemote>,
    },
    ConnectionState {
        peer_id: PeerId,
        state: RTCPeerConnectionState,
    },
    Ended {
        reason: CallEndReason,
        duration_secs: Option<u32>,
    },
    /// Relayed offers, answers or candidates were lost. This client left the
    /// call and has to join it again to renegotiate.
    RejoinRequired {
        call_id: CallId,
        missed: u64,
    },
}

impl std::fmt::Debug for MeshEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParticipantJoined { peer_id, username } => f
                .debug_struct("ParticipantJoined")
                .field("peer_id", peer_id)
                .field("username", username)
                .finish(),
            Self::ParticipantLeft { peer_id } => {
                f.debug_struct("ParticipantLeft").field("peer_id", peer_id).finish()
            }
            Self::Declined { peer_id } => f.debug_struct("Declined").field("peer_id", peer_id).finish(),
            Self::RemoteTrack { peer_id, track } => f
                .debug_struct("RemoteTrack")
                .field("peer_id", peer_id)
                .field("track_id", &track.id())
                .finish(),
            Self::ConnectionState { peer_id, state } => f
                .debug_struct("ConnectionState")
                .field("peer_id", peer_id)
                .field("state", state)
                .finish(),
            Self::Ended {
                reason,
                duration_secs,
            } => f
                .debug_struct("Ended")
                .field("reason", reason)
                .field("duration_secs", duration_secs)
                .finish(),
            Self::RejoinRequired { call_id, missed } => f
                .debug_struct("RejoinRequired")
                .field("call_id", call_id)
                .field("missed", missed)
                .finish(),
        }
    }
}

/// WebRTC API with the codecs the room path uses.
fn build_api() -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: codec_capability(MediaKind::Audio),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: codec_capability(MediaKind::Video),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_config(ice_servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// One mesh call this client takes part in.
pub struct MeshCall {
    call_id: CallId,
    signaling: Arc<dyn SignalingChannel>,
    api: API,
    rtc_config: RTCConfiguration,
    local_tracks: Mutex<Vec<Arc<LocalTrack>>>,
    connections: Mutex<HashMap<PeerId, Arc<RTCPeerConnection>>>,
    events: broadcast::Sender<MeshEvent>,
    cancel: CancellationToken,
}

impl MeshCall {
    fn new(
        call_id: CallId,
        signaling: Arc<dyn SignalingChannel>,
        api: API,
        local_tracks: Vec<Arc<LocalTrack>>,
        ice_servers: &[IceServer],
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(MESH_EVENT_CAPACITY);
        Arc::new(Self {
            call_id,
            signaling,
            api,
            rtc_config: rtc_config(ice_servers),
            local_tracks: Mutex::new(local_tracks),
            connections: Mutex::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// Ring `targets` and wait for them to join.
    pub async fn start(
        signaling: Arc<dyn SignalingChannel>,
        targets: Vec<PeerId>,
        local_tracks: Vec<Arc<LocalTrack>>,
        ice_servers: &[IceServer],
    ) -> Result<Arc<Self>, SessionError> {
        let api = build_api()?;
        let notifications = signaling.subscribe();
        let response: CallStartResponse = decode(
            signaling
                .request(ClientRequest::CallStart(CallStart {
                    call_id: None,
                    targets,
                }))
                .await?,
        )?;

        let call = Self::new(response.call_id, signaling, api, local_tracks, ice_servers);
        call.spawn_signal_loop(notifications);
        info!(call_id = %call.call_id, "Call started");
        Ok(call)
    }

    /// Join a ringing or ongoing call and offer to everyone already in it.
    pub async fn join(
        signaling: Arc<dyn SignalingChannel>,
        call_id: CallId,
        local_tracks: Vec<Arc<LocalTrack>>,
        ice_servers: &[IceServer],
    ) -> Result<Arc<Self>, SessionError> {
        let api = build_api()?;
        let notifications = signaling.subscribe();
        let response: CallJoinResponse = decode(
            signaling
                .request(ClientRequest::CallJoin(CallRef { call_id }))
                .await?,
        )?;

        let me = signaling.peer_id();
        let call = Self::new(response.call_id, signaling, api, local_tracks, ice_servers);
        call.spawn_signal_loop(notifications);

        for peer_id in response.participants.into_iter().filter(|p| *p != me) {
            if let Err(e) = call.offer(peer_id).await {
                warn!(call_id = %call_id, peer_id = %peer_id, error = %e, "Failed to offer");
            }
        }
        info!(call_id = %call_id, "Joined call");
        Ok(call)
    }

    /// Refuse an incoming call.
    pub async fn decline(
        signaling: &dyn SignalingChannel,
        call_id: CallId,
    ) -> Result<(), SessionError> {
        signaling
            .request(ClientRequest::CallDecline(CallRef { call_id }))
            .await
            .map(|_| ())
    }

    pub const fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Participants with an open peer connection.
    pub async fn participants(&self) -> Vec<PeerId> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Add a track mid-call (e.g. a screen share) and renegotiate.
    pub async fn add_local_track(&self, track: Arc<LocalTrack>) -> Result<(), SessionError> {
        let connections: Vec<(PeerId, Arc<RTCPeerConnection>)> = self
            .connections
            .lock()
            .await
            .iter()
            .map(|(id, pc)| (*id, pc.clone()))
            .collect();
        self.local_tracks.lock().await.push(track.clone());

        for (peer_id, pc) in connections {
            pc.add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            self.send_offer(peer_id, &pc).await?;
        }
        Ok(())
    }

    /// Leave the call. The call ends for everyone when the last member leaves.
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.finish(ClientRequest::CallLeave(CallRef {
            call_id: self.call_id,
        }))
        .await
    }

    /// End the call for every participant.
    pub async fn end(&self) -> Result<(), SessionError> {
        self.finish(ClientRequest::CallEnd(CallRef {
            call_id: self.call_id,
        }))
        .await
    }

    async fn finish(&self, request: ClientRequest) -> Result<(), SessionError> {
        if self.is_ended() {
            return Ok(());
        }
        let result = self.signaling.request(request).await;
        self.teardown().await;
        match result {
            Ok(_) => Ok(()),
            // Ended server-side in the meantime.
            Err(SessionError::Signaling {
                code: ErrorCode::CallNotFound | ErrorCode::NotInCall,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close every connection and stop local capture.
    async fn teardown(&self) {
        self.cancel.cancel();
        let connections: Vec<(PeerId, Arc<RTCPeerConnection>)> =
            self.connections.lock().await.drain().collect();
        for (peer_id, pc) in connections {
            if let Err(e) = pc.close().await {
                warn!(peer_id = %peer_id, error = %e, "Failed to close peer connection");
            }
        }
        for track in self.local_tracks.lock().await.drain(..) {
            track.stop();
        }
        debug!(call_id = %self.call_id, "Call torn down");
    }

    // ------------------------------------------------------------------
    // Peer connections
    // ------------------------------------------------------------------

    async fn connection(&self, peer_id: PeerId) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let mut connections = self.connections.lock().await;
        if let Some(pc) = connections.get(&peer_id) {
            return Ok(pc.clone());
        }

        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        self.setup_event_handlers(&pc, peer_id);
        for track in self.local_tracks.lock().await.iter() {
            pc.add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        connections.insert(peer_id, pc.clone());
        debug!(call_id = %self.call_id, peer_id = %peer_id, "Peer connection created");
        Ok(pc)
    }

    fn setup_event_handlers(&self, pc: &RTCPeerConnection, peer_id: PeerId) {
        let call_id = self.call_id;

        // ICE candidate handler
        let signaling = self.signaling.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaling = signaling.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize ICE candidate");
                        return;
                    }
                };
                let request = ClientRequest::CallIceCandidate(CallIceCandidate {
                    call_id,
                    to: peer_id,
                    candidate: IceCandidateInit {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    },
                });
                tokio::spawn(async move {
                    if let Err(e) = signaling.request(request).await {
                        warn!(peer_id = %peer_id, error = %e, "Failed to relay ICE candidate");
                    }
                });
            })
        }));

        // Connection state change handler
        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                info!(peer_id = %peer_id, ?state, "Peer connection state changed");
                let _ = events.send(MeshEvent::ConnectionState { peer_id, state });
            })
        }));

        // Remote track handler
        let events = self.events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                info!(
                    peer_id = %peer_id,
                    "Remote track received: {} ({})",
                    track.kind(),
                    track.codec().capability.mime_type
                );
                let _ = events.send(MeshEvent::RemoteTrack { peer_id, track });
            })
        }));
    }

    async fn offer(&self, peer_id: PeerId) -> Result<(), SessionError> {
        let pc = self.connection(peer_id).await?;
        self.send_offer(peer_id, &pc).await
    }

    async fn send_offer(&self, peer_id: PeerId, pc: &RTCPeerConnection) -> Result<(), SessionError> {
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        self.signaling
            .request(ClientRequest::CallOffer(CallSessionDescription {
                call_id: self.call_id,
                to: peer_id,
                sdp: offer.sdp,
            }))
            .await?;
        debug!(peer_id = %peer_id, "Offer sent");
        Ok(())
    }

    async fn handle_offer(&self, from: PeerId, sdp: String) -> Result<(), SessionError> {
        let pc = self.connection(from).await?;
        pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        self.signaling
            .request(ClientRequest::CallAnswer(CallSessionDescription {
                call_id: self.call_id,
                to: from,
                sdp: answer.sdp,
            }))
            .await?;
        debug!(peer_id = %from, "Answer sent");
        Ok(())
    }

    async fn existing(&self, peer_id: PeerId) -> Option<Arc<RTCPeerConnection>> {
        self.connections.lock().await.get(&peer_id).cloned()
    }

    // ------------------------------------------------------------------
    // Signal relay
    // ------------------------------------------------------------------

    fn spawn_signal_loop(self: &Arc<Self>, mut notifications: broadcast::Receiver<ServerNotification>) {
        let call: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = notifications.recv() => match received {
                        Ok(notification) => notification,
                        Err(RecvError::Lagged(skipped)) => {
                            if let Some(call) = call.upgrade() {
                                call.on_notifications_lagged(skipped).await;
                            }
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                let Some(call) = call.upgrade() else {
                    break;
                };
                match call.handle_notification(notification).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => warn!(call_id = %call.call_id, error = %e, "Call signaling failed"),
                }
            }
        });
    }

    /// Negotiation state can't be recovered after lost signals, so leave and
    /// let the caller join again.
    async fn on_notifications_lagged(&self, missed: u64) {
        if self.is_ended() {
            return;
        }
        warn!(call_id = %self.call_id, missed, "Missed call signals, rejoin required");
        if let Err(e) = self.leave().await {
            debug!(call_id = %self.call_id, error = %e, "Leave after missed signals failed");
        }
        let _ = self.events.send(MeshEvent::RejoinRequired {
            call_id: self.call_id,
            missed,
        });
    }

    /// Returns true once the call has ended.
    async fn handle_notification(
        &self,
        notification: ServerNotification,
    ) -> Result<bool, SessionError> {
        match notification {
            ServerNotification::CallOffer { call_id, from, sdp } if call_id == self.call_id => {
                self.handle_offer(from, sdp).await?;
            }
            ServerNotification::CallAnswer { call_id, from, sdp } if call_id == self.call_id => {
                let Some(pc) = self.existing(from).await else {
                    warn!(peer_id = %from, "Answer from unknown participant");
                    return Ok(false);
                };
                pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
            }
            ServerNotification::CallIceCandidate {
                call_id,
                from,
                candidate,
            } if call_id == self.call_id => {
                let Some(pc) = self.existing(from).await else {
                    debug!(peer_id = %from, "Candidate before offer, dropped");
                    return Ok(false);
                };
                pc.add_ice_candidate(RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_m_line_index,
                    username_fragment: candidate.username_fragment,
                })
                .await?;
            }
            ServerNotification::CallParticipantJoined {
                call_id,
                peer_id,
                username,
            } if call_id == self.call_id => {
                let _ = self
                    .events
                    .send(MeshEvent::ParticipantJoined { peer_id, username });
            }
            ServerNotification::CallParticipantLeft { call_id, peer_id }
                if call_id == self.call_id =>
            {
                let pc = self.connections.lock().await.remove(&peer_id);
                if let Some(pc) = pc {
                    pc.close().await?;
                }
                let _ = self.events.send(MeshEvent::ParticipantLeft { peer_id });
            }
            ServerNotification::CallDeclined { call_id, peer_id } if call_id == self.call_id => {
                let _ = self.events.send(MeshEvent::Declined { peer_id });
            }
            ServerNotification::CallEnded {
                call_id,
                reason,
                duration_secs,
            } if call_id == self.call_id => {
                info!(call_id = %call_id, ?reason, "Call ended");
                self.teardown().await;
                let _ = self.events.send(MeshEvent::Ended {
                    reason,
                    duration_secs,
                });
                return Ok(true);
            }
            _ => {}
        }
        Ok(false)
    }
}

#[async_trait]
impl MediaSession for MeshCall {
    fn topology(&self) -> Topology {
        Topology::Mesh
    }

    async fn leave(&self) -> Result<(), SessionError> {
        Self::leave(self).await
    }
}
