//! Session Controller
//!
//! Drives one SFU room membership from the client side. Joining negotiates
//! capabilities and opens both transports, remote producers are consumed and
//! handed to playback, and the media toggles map onto producer and consumer
//! pause/resume/close requests. Nothing is ever renegotiated.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vc_common::protocol::{
    ClientRequest, ConsumerRef, JoinRoomResponse, ProducerRef, RegisterCapabilities, RoomRef,
    ServerNotification, SetMediaState, SetScreenShareQuality,
};
use vc_common::{
    IceState, MediaKind, MediaState, PeerId, PeerInfo, ProducerId, ProducerInfo, Quality, RoomId,
    TrackSource, TransportDirection, TransportId,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::util::vnet::net::Net;

use crate::device::Device;
use crate::error::SessionError;
use crate::media::{LocalTrack, MediaDevices, PlaybackSink, RemoteTrack, Surface};
use crate::signaling::{decode, SignalingChannel};
use crate::transport::ClientTransport;
use crate::{MediaSession, Topology};

/// Buffered UI events per subscriber.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Events for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined {
        room_id: RoomId,
        peers: Vec<PeerInfo>,
    },
    PeerJoined(PeerInfo),
    PeerLeft {
        peer_id: PeerId,
        username: String,
    },
    /// A remote track is attached to playback.
    RemoteTrack(RemoteTrack),
    RemoteTrackEnded {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    RemoteTrackPaused {
        producer_id: ProducerId,
        peer_id: PeerId,
        paused: bool,
    },
    PeerMediaState {
        peer_id: PeerId,
        state: MediaState,
    },
    /// Capture refused; the session carries on without this source.
    LocalMediaDenied {
        source: TrackSource,
        message: String,
    },
    ProduceFailed {
        source: TrackSource,
        message: String,
    },
    /// A transport died; its producers or consumers are gone.
    TransportFailed {
        direction: TransportDirection,
        reason: String,
    },
    ScreenShareQualityChanged {
        peer_id: PeerId,
        producer_id: ProducerId,
        quality: Quality,
    },
    RoomClosed {
        room_id: RoomId,
        reason: String,
    },
    /// Notifications were lost, so the local view of the room can no longer
    /// be trusted. The session has left the room and must join again.
    RejoinRequired {
        room_id: RoomId,
        missed: u64,
    },
    Left {
        room_id: RoomId,
    },
}

struct LocalProducer {
    id: ProducerId,
    track: Arc<LocalTrack>,
    sender: Arc<RTCRtpSender>,
}

impl LocalProducer {
    /// Stop capture and detach the RTP sender from the transport.
    fn stop(self) {
        self.track.stop();
        let sender = self.sender;
        tokio::spawn(async move {
            if let Err(e) = sender.stop().await {
                debug!(error = %e, "RTP sender did not stop cleanly");
            }
        });
    }
}

struct RemoteConsumer {
    track: RemoteTrack,
    paused: bool,
}

struct JoinedRoom {
    room_id: RoomId,
    device: Device,
    send: Arc<ClientTransport>,
    recv: Arc<ClientTransport>,
    peers: HashMap<PeerId, PeerInfo>,
    producers: HashMap<TrackSource, LocalProducer>,
    consumers: HashMap<ProducerId, RemoteConsumer>,
    media: MediaState,
    cancel: CancellationToken,
}

impl JoinedRoom {
    fn transport(&self, direction: TransportDirection) -> &Arc<ClientTransport> {
        match direction {
            TransportDirection::Send => &self.send,
            TransportDirection::Recv => &self.recv,
        }
    }

    fn producer_ref(&self, producer_id: ProducerId) -> ProducerRef {
        ProducerRef {
            room_id: self.room_id.clone(),
            producer_id,
        }
    }
}

/// Client side of one SFU room membership.
pub struct SessionController {
    signaling: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    playback: Arc<dyn PlaybackSink>,
    network: Option<Arc<Net>>,
    state: Mutex<Option<JoinedRoom>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        playback: Arc<dyn PlaybackSink>,
    ) -> Arc<Self> {
        Self::build(signaling, devices, playback, None)
    }

    /// Like [`Self::new`], with transports bound to `network` instead of
    /// the host interfaces.
    pub fn with_network(
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        playback: Arc<dyn PlaybackSink>,
        network: Arc<Net>,
    ) -> Arc<Self> {
        Self::build(signaling, devices, playback, Some(network))
    }

    fn build(
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        playback: Arc<dyn PlaybackSink>,
        network: Option<Arc<Net>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            signaling,
            devices,
            playback,
            network,
            state: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn peer_id(&self) -> PeerId {
        self.signaling.peer_id()
    }

    pub async fn room_id(&self) -> Option<RoomId> {
        self.state.lock().await.as_ref().map(|r| r.room_id.clone())
    }

    pub async fn is_joined(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Local media state, `None` when not joined.
    pub async fn media_state(&self) -> Option<MediaState> {
        self.state.lock().await.as_ref().map(|r| r.media)
    }

    /// Producer currently publishing `source`.
    pub async fn producer_id(&self, source: TrackSource) -> Option<ProducerId> {
        self.state
            .lock()
            .await
            .as_ref()
            .and_then(|r| r.producers.get(&source).map(|p| p.id))
    }

    /// Remote tracks currently attached to playback.
    pub async fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|r| r.consumers.values().map(|c| c.track.clone()).collect())
            .unwrap_or_default()
    }

    /// Transport in `direction`, for the media backend.
    pub async fn transport(&self, direction: TransportDirection) -> Option<Arc<ClientTransport>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|r| r.transport(direction).clone())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn request(&self, request: ClientRequest) -> Result<Value, SessionError> {
        self.signaling.request(request).await
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    /// Join a room and publish the microphone.
    ///
    /// A microphone that cannot be captured leaves the session listen-only
    /// and is reported as [`SessionEvent::LocalMediaDenied`].
    #[instrument(skip_all, fields(peer_id = %self.peer_id(), room_id = %room_id))]
    pub async fn join(self: &Arc<Self>, room_id: RoomId) -> Result<Vec<PeerInfo>, SessionError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(SessionError::AlreadyJoined);
        }

        // Subscribe first so producers announced after the join snapshot are not missed.
        let notifications = self.signaling.subscribe();
        let joined = self
            .request(ClientRequest::JoinRoom(RoomRef {
                room_id: room_id.clone(),
            }))
            .await;
        let response: JoinRoomResponse = match joined.and_then(decode::<JoinRoomResponse>) {
            Ok(response) => response,
            Err(e) => {
                // The server may have admitted us even though we saw no usable answer.
                if !matches!(e, SessionError::AlreadyJoined | SessionError::Disconnected) {
                    warn!(error = %e, "Join failed, leaving room");
                    self.leave_quietly(room_id).await;
                }
                return Err(e);
            }
        };

        let mut room = match self.setup(&room_id, &response).await {
            Ok(room) => room,
            Err(e) => {
                warn!(error = %e, "Join setup failed, leaving room");
                self.leave_quietly(room_id).await;
                return Err(e);
            }
        };

        for producer in response.producers {
            self.consume_producer(&mut room, producer).await;
        }

        tokio::spawn(run_notifications(
            Arc::downgrade(self),
            self.signaling.clone(),
            notifications,
            room.cancel.clone(),
        ));
        *state = Some(room);
        drop(state);

        info!(peers = response.peers.len(), "Joined room");
        self.emit(SessionEvent::Joined {
            room_id,
            peers: response.peers.clone(),
        });

        if let Err(e) = self.publish(TrackSource::Microphone, None).await {
            info!(error = %e, "Continuing listen-only");
        }
        Ok(response.peers)
    }

    /// Best-effort `leave-room` for a membership we are giving up on.
    async fn leave_quietly(&self, room_id: RoomId) {
        match self
            .request(ClientRequest::LeaveRoom(RoomRef { room_id }))
            .await
        {
            Ok(_) | Err(SessionError::NotJoined) => {}
            Err(e) => debug!(error = %e, "Leave after failed join not acknowledged"),
        }
    }

    async fn setup(
        self: &Arc<Self>,
        room_id: &RoomId,
        response: &JoinRoomResponse,
    ) -> Result<JoinedRoom, SessionError> {
        let device = Device::load(
            &response.router_rtp_capabilities,
            &Device::local_capabilities(),
        )?;
        self.request(ClientRequest::RegisterCapabilities(RegisterCapabilities {
            room_id: room_id.clone(),
            rtp_capabilities: device.rtp_capabilities().clone(),
        }))
        .await?;

        let send = ClientTransport::create(
            self.signaling.clone(),
            room_id.clone(),
            TransportDirection::Send,
            self.network.clone(),
        )
        .await?;
        self.watch_ice(&send);
        let recv = match ClientTransport::create(
            self.signaling.clone(),
            room_id.clone(),
            TransportDirection::Recv,
            self.network.clone(),
        )
        .await
        {
            Ok(recv) => recv,
            Err(e) => {
                send.close();
                return Err(e);
            }
        };
        self.watch_ice(&recv);
        if let Err(e) = recv.connect().await {
            send.close();
            recv.close();
            return Err(e);
        }

        Ok(JoinedRoom {
            room_id: room_id.clone(),
            device,
            send,
            recv,
            peers: response
                .peers
                .iter()
                .map(|p| (p.peer_id, p.clone()))
                .collect(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            media: MediaState::default(),
            cancel: CancellationToken::new(),
        })
    }

    /// Stop local tracks, close transports and leave the room.
    #[instrument(skip_all, fields(peer_id = %self.peer_id()))]
    pub async fn leave(&self) -> Result<(), SessionError> {
        let room = self
            .state
            .lock()
            .await
            .take()
            .ok_or(SessionError::NotJoined)?;
        let room_id = room.room_id.clone();
        self.teardown(room);

        let result = self
            .request(ClientRequest::LeaveRoom(RoomRef {
                room_id: room_id.clone(),
            }))
            .await;
        info!(room_id = %room_id, "Left room");
        self.emit(SessionEvent::Left { room_id });

        match result {
            Ok(_) | Err(SessionError::NotJoined) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn teardown(&self, mut room: JoinedRoom) {
        room.cancel.cancel();
        for (_, producer) in room.producers.drain() {
            producer.stop();
        }
        for (producer_id, _) in room.consumers.drain() {
            self.playback.detach(producer_id);
        }
        if room.media.deafened {
            self.playback.set_muted(false);
        }
        room.send.close();
        room.recv.close();
    }

    async fn on_disconnected(&self) {
        if let Some(room) = self.state.lock().await.take() {
            warn!(room_id = %room.room_id, "Signaling lost, leaving room locally");
            let room_id = room.room_id.clone();
            self.teardown(room);
            self.emit(SessionEvent::Left { room_id });
        }
    }

    /// Notifications were dropped: peers, producers and pause states may all
    /// be stale. Leave so the next join starts from a fresh snapshot.
    async fn on_notifications_lagged(&self, membership: &CancellationToken, missed: u64) {
        let mut guard = self.state.lock().await;
        // The membership the loop served may already be gone.
        if membership.is_cancelled() {
            return;
        }
        let Some(room) = guard.take() else {
            return;
        };
        drop(guard);
        let room_id = room.room_id.clone();
        warn!(room_id = %room_id, missed, "Missed room notifications, rejoin required");
        self.teardown(room);
        self.leave_quietly(room_id.clone()).await;
        self.emit(SessionEvent::RejoinRequired { room_id, missed });
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    async fn publish(
        &self,
        source: TrackSource,
        quality: Option<Quality>,
    ) -> Result<ProducerId, SessionError> {
        let mut guard = self.state.lock().await;
        let room = guard.as_mut().ok_or(SessionError::NotJoined)?;
        if let Some(existing) = room.producers.get(&source) {
            return Ok(existing.id);
        }

        let track = match self.devices.acquire(source, quality).await {
            Ok(track) => track,
            Err(e) => {
                let message = e.to_string();
                warn!(?source, %message, "Local media unavailable");
                self.emit(SessionEvent::LocalMediaDenied {
                    source,
                    message: message.clone(),
                });
                return Err(SessionError::LocalMediaDenied {
                    track: source,
                    message,
                });
            }
        };

        let produced = match room.device.send_parameters(
            source,
            track.ssrc(),
            &self.peer_id().to_string(),
            quality,
        ) {
            Ok(parameters) => room.send.produce(&track, parameters).await,
            Err(e) => Err(e),
        };
        let publication = match produced {
            Ok(publication) => publication,
            Err(e) => {
                track.stop();
                warn!(?source, error = %e, "Produce failed");
                self.emit(SessionEvent::ProduceFailed {
                    source,
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let producer_id = publication.producer_id;
        if source == TrackSource::Microphone && room.media.muted {
            track.set_enabled(false);
            if let Err(e) = self
                .request(ClientRequest::PauseProducer(room.producer_ref(producer_id)))
                .await
            {
                warn!(error = %e, "Failed to pause muted microphone");
            }
        }
        match source {
            TrackSource::Camera => room.media.video_enabled = true,
            TrackSource::ScreenVideo => room.media.screen_sharing = true,
            TrackSource::Microphone | TrackSource::ScreenAudio => {}
        }

        debug!(?source, producer_id = %producer_id, "Publishing");
        room.producers.insert(
            source,
            LocalProducer {
                id: producer_id,
                track,
                sender: publication.sender,
            },
        );
        Ok(producer_id)
    }

    async fn unpublish(&self, source: TrackSource) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let room = guard.as_mut().ok_or(SessionError::NotJoined)?;
        let Some(producer) = room.producers.remove(&source) else {
            return Ok(());
        };
        let producer_ref = room.producer_ref(producer.id);
        producer.stop();

        let request = match source {
            TrackSource::Camera => {
                room.media.video_enabled = false;
                ClientRequest::StopVideo(producer_ref)
            }
            TrackSource::ScreenVideo | TrackSource::ScreenAudio => {
                // The server closes the companion screen track as well.
                for companion in [TrackSource::ScreenVideo, TrackSource::ScreenAudio] {
                    if let Some(other) = room.producers.remove(&companion) {
                        other.stop();
                    }
                }
                room.media.screen_sharing = false;
                ClientRequest::StopScreenShare(producer_ref)
            }
            TrackSource::Microphone => ClientRequest::CloseProducer(producer_ref),
        };
        self.request(request).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Toggles
    // ------------------------------------------------------------------

    /// Pause or resume the microphone producer.
    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let room = guard.as_mut().ok_or(SessionError::NotJoined)?;
        room.media.muted = muted;

        let request = if let Some(mic) = room.producers.get(&TrackSource::Microphone) {
            mic.track.set_enabled(!muted);
            let producer_ref = room.producer_ref(mic.id);
            if muted {
                ClientRequest::PauseProducer(producer_ref)
            } else {
                ClientRequest::ResumeProducer(producer_ref)
            }
        } else {
            // Listen-only: nothing to pause, just tell the room.
            ClientRequest::SetMediaState(SetMediaState {
                room_id: room.room_id.clone(),
                muted: Some(muted),
                deafened: None,
            })
        };
        self.request(request).await.map(|_| ())
    }

    /// Pause or resume every audio consumer and silence playback.
    pub async fn set_deafened(&self, deafened: bool) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let room = guard.as_mut().ok_or(SessionError::NotJoined)?;
        if room.media.deafened == deafened {
            return Ok(());
        }
        room.media.deafened = deafened;
        self.playback.set_muted(deafened);

        let room_id = room.room_id.clone();
        for consumer in room
            .consumers
            .values_mut()
            .filter(|c| c.track.kind == MediaKind::Audio)
        {
            let consumer_ref = ConsumerRef {
                room_id: room_id.clone(),
                consumer_id: consumer.track.consumer_id,
            };
            let request = if deafened {
                ClientRequest::PauseConsumer(consumer_ref)
            } else {
                ClientRequest::ResumeConsumer(consumer_ref)
            };
            match self.signaling.request(request).await {
                Ok(_) => consumer.paused = deafened,
                Err(e) => warn!(
                    consumer_id = %consumer.track.consumer_id,
                    error = %e,
                    "Failed to update consumer for deafen"
                ),
            }
        }

        self.request(ClientRequest::SetMediaState(SetMediaState {
            room_id,
            muted: None,
            deafened: Some(deafened),
        }))
        .await
        .map(|_| ())
    }

    /// Start or stop the camera.
    pub async fn set_camera(&self, enabled: bool) -> Result<(), SessionError> {
        if enabled {
            self.publish(TrackSource::Camera, None).await.map(|_| ())
        } else {
            self.unpublish(TrackSource::Camera).await
        }
    }

    /// Start sharing the screen, optionally with system audio.
    ///
    /// While a share is active this only switches the quality tier.
    pub async fn start_screen_share(
        &self,
        quality: Quality,
        with_audio: bool,
    ) -> Result<ProducerId, SessionError> {
        if let Some(active) = self.producer_id(TrackSource::ScreenVideo).await {
            self.set_screen_share_quality(quality).await?;
            return Ok(active);
        }

        let producer_id = self.publish(TrackSource::ScreenVideo, Some(quality)).await?;
        if with_audio {
            if let Err(e) = self.publish(TrackSource::ScreenAudio, None).await {
                debug!(error = %e, "Sharing screen without audio");
            }
        }
        Ok(producer_id)
    }

    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        self.unpublish(TrackSource::ScreenVideo).await
    }

    /// Retune the active screen share. The producer id stays the same.
    pub async fn set_screen_share_quality(&self, quality: Quality) -> Result<(), SessionError> {
        let guard = self.state.lock().await;
        let room = guard.as_ref().ok_or(SessionError::NotJoined)?;
        let producer = room
            .producers
            .get(&TrackSource::ScreenVideo)
            .ok_or(SessionError::ScreenShareInactive)?;

        producer.track.apply_quality(quality);
        self.request(ClientRequest::SetScreenShareQuality(SetScreenShareQuality {
            room_id: room.room_id.clone(),
            producer_id: producer.id,
            quality,
        }))
        .await?;

        self.emit(SessionEvent::ScreenShareQualityChanged {
            peer_id: self.peer_id(),
            producer_id: producer.id,
            quality,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    /// Feed an ICE state for the current transport in `direction`.
    pub async fn handle_ice_state(
        &self,
        direction: TransportDirection,
        state: IceState,
    ) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let room = guard.as_mut().ok_or(SessionError::NotJoined)?;
        self.apply_ice_state(room, direction, state);
        Ok(())
    }

    fn apply_ice_state(&self, room: &mut JoinedRoom, direction: TransportDirection, state: IceState) {
        if room.transport(direction).handle_ice_state(state) {
            self.release_transport(room, direction, format!("ICE {state:?}"));
        }
    }

    /// Route the ICE agent's state changes back into the controller.
    fn watch_ice(self: &Arc<Self>, transport: &ClientTransport) {
        let controller = Arc::downgrade(self);
        let direction = transport.direction();
        let transport_id = transport.id();
        transport.on_ice_state(move |state| {
            let Some(controller) = controller.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                controller
                    .on_transport_ice_state(direction, transport_id, state)
                    .await;
            });
        });
    }

    async fn on_transport_ice_state(
        &self,
        direction: TransportDirection,
        transport_id: TransportId,
        state: IceState,
    ) {
        let mut guard = self.state.lock().await;
        // Transports of an earlier membership report too.
        let Some(room) = guard
            .as_mut()
            .filter(|r| r.transport(direction).id() == transport_id)
        else {
            return;
        };
        debug!(%direction, ?state, "ICE state changed");
        self.apply_ice_state(room, direction, state);
    }

    /// Drop everything that depended on a closed transport.
    fn release_transport(
        &self,
        room: &mut JoinedRoom,
        direction: TransportDirection,
        reason: String,
    ) {
        match direction {
            TransportDirection::Send => {
                for (_, producer) in room.producers.drain() {
                    producer.stop();
                }
                room.media.video_enabled = false;
                room.media.screen_sharing = false;
            }
            TransportDirection::Recv => {
                let producer_ids: Vec<ProducerId> = room.consumers.keys().copied().collect();
                for producer_id in producer_ids {
                    self.drop_consumer(room, producer_id);
                }
            }
        }
        warn!(%direction, %reason, "Transport failed");
        self.emit(SessionEvent::TransportFailed { direction, reason });
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    async fn consume_producer(&self, room: &mut JoinedRoom, producer: ProducerInfo) {
        if producer.peer_id == self.peer_id()
            || room.consumers.contains_key(&producer.producer_id)
            || room.recv.is_closed()
        {
            return;
        }
        if let Err(e) = self.try_consume(room, producer.producer_id).await {
            warn!(producer_id = %producer.producer_id, error = %e, "Failed to consume producer");
        }
    }

    async fn try_consume(
        &self,
        room: &mut JoinedRoom,
        producer_id: ProducerId,
    ) -> Result<(), SessionError> {
        let (options, media) = room.recv.consume(producer_id, None).await?;
        let track = RemoteTrack::new(&options, media);
        self.playback
            .attach(track.clone(), Surface::for_source(track.source));

        // Consumers start paused; audio stays paused while deafened.
        let mut paused = room.media.deafened && track.kind == MediaKind::Audio;
        if !paused {
            if let Err(e) = self
                .request(ClientRequest::ResumeConsumer(ConsumerRef {
                    room_id: room.room_id.clone(),
                    consumer_id: options.id,
                }))
                .await
            {
                warn!(consumer_id = %options.id, error = %e, "Failed to resume consumer");
                paused = true;
            }
        }

        debug!(producer_id = %producer_id, consumer_id = %options.id, "Consuming");
        room.consumers.insert(
            producer_id,
            RemoteConsumer {
                track: track.clone(),
                paused,
            },
        );
        self.emit(SessionEvent::RemoteTrack(track));
        Ok(())
    }

    fn drop_consumer(&self, room: &mut JoinedRoom, producer_id: ProducerId) {
        if let Some(consumer) = room.consumers.remove(&producer_id) {
            self.playback.detach(producer_id);
            let media = Arc::clone(&consumer.track.media);
            tokio::spawn(async move {
                if let Err(e) = media.stop().await {
                    debug!(error = %e, "RTP receiver did not stop cleanly");
                }
            });
            debug!(producer_id = %producer_id, paused = consumer.paused, "Remote track ended");
            self.emit(SessionEvent::RemoteTrackEnded {
                producer_id,
                peer_id: consumer.track.peer_id,
            });
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn handle_notification(&self, notification: ServerNotification) {
        let mut guard = self.state.lock().await;

        if let ServerNotification::RoomClosed { room_id, reason } = notification {
            if guard.as_ref().is_some_and(|r| r.room_id == room_id) {
                if let Some(room) = guard.take() {
                    self.teardown(room);
                }
                warn!(room_id = %room_id, %reason, "Room closed");
                self.emit(SessionEvent::RoomClosed { room_id, reason });
            }
            return;
        }

        let Some(room) = guard.as_mut() else {
            return;
        };

        match notification {
            ServerNotification::NewProducer(producer) => {
                self.consume_producer(room, producer).await;
            }
            ServerNotification::ProducerClosed { producer_id, .. }
            | ServerNotification::ConsumerClosed { producer_id, .. } => {
                self.drop_consumer(room, producer_id);
            }
            ServerNotification::ProducerPaused {
                producer_id,
                peer_id,
            } => self.emit(SessionEvent::RemoteTrackPaused {
                producer_id,
                peer_id,
                paused: true,
            }),
            ServerNotification::ProducerResumed {
                producer_id,
                peer_id,
            } => self.emit(SessionEvent::RemoteTrackPaused {
                producer_id,
                peer_id,
                paused: false,
            }),
            ServerNotification::PeerJoined(peer) => {
                room.peers.insert(peer.peer_id, peer.clone());
                self.emit(SessionEvent::PeerJoined(peer));
            }
            ServerNotification::PeerLeft { peer_id, username } => {
                room.peers.remove(&peer_id);
                let orphaned: Vec<ProducerId> = room
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.track.peer_id == peer_id)
                    .map(|(id, _)| *id)
                    .collect();
                for producer_id in orphaned {
                    self.drop_consumer(room, producer_id);
                }
                self.emit(SessionEvent::PeerLeft { peer_id, username });
            }
            ServerNotification::PeerMediaState { peer_id, state } => {
                if let Some(peer) = room.peers.get_mut(&peer_id) {
                    peer.media_state = state;
                }
                self.emit(SessionEvent::PeerMediaState { peer_id, state });
            }
            ServerNotification::ScreenShareQualityChanged {
                peer_id,
                producer_id,
                quality,
            } => self.emit(SessionEvent::ScreenShareQualityChanged {
                peer_id,
                producer_id,
                quality,
            }),
            ServerNotification::TransportClosed {
                transport_id,
                reason,
            } => {
                let direction = [TransportDirection::Send, TransportDirection::Recv]
                    .into_iter()
                    .find(|d| room.transport(*d).id() == transport_id);
                if let Some(direction) = direction {
                    if room.transport(direction).close() {
                        self.release_transport(room, direction, reason);
                    }
                }
            }
            // Ready and mesh call traffic are not room events.
            _ => {}
        }
    }
}

async fn run_notifications(
    controller: Weak<SessionController>,
    signaling: Arc<dyn SignalingChannel>,
    mut notifications: broadcast::Receiver<ServerNotification>,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            () = cancel.cancelled() => break,
            () = signaling.closed() => {
                if let Some(controller) = controller.upgrade() {
                    controller.on_disconnected().await;
                }
                break;
            }
            received = notifications.recv() => match received {
                Ok(notification) => notification,
                Err(RecvError::Lagged(skipped)) => {
                    if let Some(controller) = controller.upgrade() {
                        controller.on_notifications_lagged(&cancel, skipped).await;
                    }
                    break;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_notification(notification).await;
    }
    debug!("Session notification loop stopped");
}

#[async_trait]
impl MediaSession for SessionController {
    fn topology(&self) -> Topology {
        Topology::Sfu
    }

    async fn leave(&self) -> Result<(), SessionError> {
        Self::leave(self).await
    }
}
