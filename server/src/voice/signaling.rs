//! Signaling Service
//!
//! Executes client requests against the media engine and keeps room
//! membership, announcements and teardown consistent.
//!
//! Every request runs on its own task bounded by the configured timeout, so
//! a stalled request fails with `timeout` instead of hanging its ack.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};
use vc_common::protocol::{
    Ack, CallJoinResponse, CallStartResponse, ClientRequest, ConnectTransport, Consume,
    ConsumerOptions, ConsumerRef, CreateTransport, JoinRoomResponse, Produce, ProduceResponse,
    ProducerRef, RegisterCapabilities, RequestEnvelope, ServerFrame, ServerNotification,
    SetMediaState, SetScreenShareQuality, TransportOptions,
};
use vc_common::{PeerId, RoomId, TrackSource, TransportDirection, TransportId};

use super::call_service::CallService;
use super::error::VoiceError;
use super::peer::{Peer, PeerState};
use super::rate_limit::JoinThrottle;
use super::registry::RouterRegistry;
use super::room::Room;
use super::session::{Session, SessionRegistry, SESSION_CHANNEL_CAPACITY};
use crate::config::Config;
use crate::engine::{CloseReport, Consumer, EngineError, ProduceRequest, Router, RouterEvent};

fn to_value<T: Serialize>(value: &T) -> Result<Value, VoiceError> {
    serde_json::to_value(value).map_err(|e| VoiceError::Internal(e.to_string()))
}

fn empty() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Drives rooms and calls from signaling requests.
#[derive(Debug)]
pub struct SignalingService {
    config: Arc<Config>,
    registry: Arc<RouterRegistry>,
    rooms: DashMap<RoomId, Arc<Room>>,
    sessions: Arc<SessionRegistry>,
    calls: Arc<CallService>,
    join_throttle: Arc<JoinThrottle>,
}

impl SignalingService {
    pub fn new(config: Arc<Config>, registry: Arc<RouterRegistry>) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new());
        let calls = Arc::new(CallService::new(
            sessions.clone(),
            config.call_ring_timeout(),
        ));
        let join_throttle = Arc::new(JoinThrottle::new(config.join_rate_limit()));
        Arc::new(Self {
            config,
            registry,
            rooms: DashMap::new(),
            sessions,
            calls,
            join_throttle,
        })
    }

    pub const fn registry(&self) -> &Arc<RouterRegistry> {
        &self.registry
    }

    pub const fn calls(&self) -> &Arc<CallService> {
        &self.calls
    }

    pub const fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Start background maintenance (join throttle pruning).
    pub fn start_maintenance(&self) -> tokio::task::JoinHandle<()> {
        self.join_throttle.spawn_pruner()
    }

    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|room| room.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Register a new signaling connection and announce its peer id.
    pub fn connect(&self, username: String) -> (Arc<Session>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let session = Arc::new(Session::new(PeerId::new(), username, tx));
        self.sessions.insert(session.clone());
        session.notify(ServerNotification::Ready {
            peer_id: session.peer_id(),
        });
        info!(peer_id = %session.peer_id(), username = %session.username(), "Signaling session opened");
        (session, rx)
    }

    /// Tear down everything a connection owns.
    pub async fn disconnect(&self, session: &Arc<Session>) {
        if let Some(peer) = session.membership() {
            self.leave_room(session, &peer).await;
        }
        self.calls.leave_all(session.peer_id());
        self.join_throttle.forget(session.peer_id());
        self.sessions.remove(session.peer_id());
        info!(peer_id = %session.peer_id(), "Signaling session closed");
    }

    /// Handle one text frame from a client.
    pub async fn handle_frame(self: &Arc<Self>, session: &Arc<Session>, text: &str) {
        let envelope = match RequestEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer_id = %session.peer_id(), error = %e, "Malformed signaling frame");
                return;
            }
        };
        let id = envelope.id;
        let event = envelope.event.clone();

        let result = match envelope.into_request() {
            Ok(request) => self.dispatch(session, request).await,
            Err(e) => Err(VoiceError::from(e)),
        };

        match (id, result) {
            (Some(id), Ok(data)) => session.ack(Ack::ok(id, data)).await,
            (Some(id), Err(e)) => {
                debug!(peer_id = %session.peer_id(), event = %event, error = %e, "Request failed");
                session.ack(Ack::error(id, e.code(), e.client_message())).await;
            }
            (None, Err(e)) => {
                debug!(peer_id = %session.peer_id(), event = %event, error = %e, "Unacknowledged request failed");
            }
            (None, Ok(_)) => {}
        }
    }

    /// Run `request` on its own task, bounded by the request timeout. A
    /// request that times out is aborted so it cannot finish after its
    /// failure was acked.
    async fn dispatch(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: ClientRequest,
    ) -> Result<Value, VoiceError> {
        let timeout = self.config.signaling_request_timeout();
        let service = self.clone();
        let task_session = session.clone();
        let mut task = tokio::spawn(async move { service.handle(&task_session, request).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(VoiceError::Internal(format!("request task failed: {e}"))),
            Err(_) => {
                task.abort();
                Err(VoiceError::Timeout(
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Execute one request.
    #[instrument(skip_all, fields(peer_id = %session.peer_id(), event = request.event()))]
    pub async fn handle(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: ClientRequest,
    ) -> Result<Value, VoiceError> {
        match request {
            ClientRequest::JoinRoom(req) => {
                let response = self.join_room(session, req.room_id).await?;
                to_value(&response)
            }
            ClientRequest::RegisterCapabilities(req) => {
                self.register_capabilities(session, req)?;
                Ok(empty())
            }
            ClientRequest::CreateTransport(req) => {
                let options = self.create_transport(session, req).await?;
                to_value(&options)
            }
            ClientRequest::ConnectTransport(req) => {
                self.connect_transport(session, req).await?;
                Ok(empty())
            }
            ClientRequest::Produce(req) => {
                let response = self.produce(session, req).await?;
                to_value(&response)
            }
            ClientRequest::Consume(req) => {
                let options = self.consume(session, req).await?;
                to_value(&options)
            }
            ClientRequest::ResumeConsumer(req) => {
                self.set_consumer_paused(session, req, false).await?;
                Ok(empty())
            }
            ClientRequest::PauseConsumer(req) => {
                self.set_consumer_paused(session, req, true).await?;
                Ok(empty())
            }
            ClientRequest::PauseProducer(req) => {
                self.set_producer_paused(session, req, true).await?;
                Ok(empty())
            }
            ClientRequest::ResumeProducer(req) => {
                self.set_producer_paused(session, req, false).await?;
                Ok(empty())
            }
            ClientRequest::StopScreenShare(req) => {
                self.close_producer(session, req, Some(TrackSource::ScreenVideo))
                    .await?;
                Ok(empty())
            }
            ClientRequest::StopVideo(req) => {
                self.close_producer(session, req, Some(TrackSource::Camera))
                    .await?;
                Ok(empty())
            }
            ClientRequest::CloseProducer(req) => {
                self.close_producer(session, req, None).await?;
                Ok(empty())
            }
            ClientRequest::SetScreenShareQuality(req) => {
                self.set_screen_share_quality(session, req).await?;
                Ok(empty())
            }
            ClientRequest::SetMediaState(req) => {
                self.set_media_state(session, req).await?;
                Ok(empty())
            }
            ClientRequest::LeaveRoom(req) => {
                let peer = Self::member(session, &req.room_id)?;
                self.leave_room(session, &peer).await;
                Ok(empty())
            }
            ClientRequest::Ping(_) => Ok(empty()),
            ClientRequest::CallStart(req) => {
                let call_id = self.calls.start_call(session, req.call_id, req.targets)?;
                to_value(&CallStartResponse { call_id })
            }
            ClientRequest::CallJoin(req) => {
                let participants = self.calls.join_call(session, req.call_id)?;
                to_value(&CallJoinResponse {
                    call_id: req.call_id,
                    participants,
                })
            }
            ClientRequest::CallDecline(req) => {
                self.calls.decline_call(session.peer_id(), req.call_id)?;
                Ok(empty())
            }
            ClientRequest::CallLeave(req) => {
                self.calls.leave_call(session.peer_id(), req.call_id)?;
                Ok(empty())
            }
            ClientRequest::CallEnd(req) => {
                self.calls.end_call(session.peer_id(), req.call_id)?;
                Ok(empty())
            }
            ClientRequest::CallOffer(req) => {
                self.calls.relay_offer(session.peer_id(), req)?;
                Ok(empty())
            }
            ClientRequest::CallAnswer(req) => {
                self.calls.relay_answer(session.peer_id(), req)?;
                Ok(empty())
            }
            ClientRequest::CallIceCandidate(req) => {
                self.calls.relay_ice_candidate(session.peer_id(), req)?;
                Ok(empty())
            }
        }
    }

    // ------------------------------------------------------------------
    // Room membership
    // ------------------------------------------------------------------

    /// The session's membership of `room_id`.
    fn member(session: &Session, room_id: &RoomId) -> Result<Arc<Peer>, VoiceError> {
        session
            .membership()
            .filter(|peer| peer.room_id() == room_id)
            .ok_or_else(|| VoiceError::NotInRoom(room_id.clone()))
    }

    fn joined_member(session: &Session, room_id: &RoomId) -> Result<Arc<Peer>, VoiceError> {
        let peer = Self::member(session, room_id)?;
        peer.ensure_joined()?;
        Ok(peer)
    }

    fn room_and_router(&self, room_id: &RoomId) -> Result<(Arc<Room>, Arc<Router>), VoiceError> {
        let room = self
            .room(room_id)
            .ok_or_else(|| VoiceError::RoomNotFound(room_id.clone()))?;
        let router = room
            .router()
            .cloned()
            .ok_or_else(|| VoiceError::RoomNotFound(room_id.clone()))?;
        Ok((room, router))
    }

    async fn join_room(
        self: &Arc<Self>,
        session: &Arc<Session>,
        room_id: RoomId,
    ) -> Result<JoinRoomResponse, VoiceError> {
        if let Some(current) = session.membership() {
            return Err(VoiceError::AlreadyJoined(current.room_id().clone()));
        }
        self.join_throttle.admit(session.peer_id())?;

        // Pending count is taken under the entry lock so cleanup never
        // removes a room a join is about to enter.
        let pending = {
            let entry = self
                .rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(Room::new(room_id.clone(), self.config.max_peers_per_room)));
            entry.value().begin_join()
        };
        let room = pending.room().clone();

        let router = match room.router() {
            Some(router) => router.clone(),
            None => {
                let router = match self.registry.get_or_create(&room_id).await {
                    Ok(router) => router,
                    Err(e) => {
                        drop(pending);
                        self.release_room(&room_id);
                        return Err(e.into());
                    }
                };
                if room.attach_router(router.clone()) {
                    self.watch_router(room.clone(), router.clone());
                }
                room.router().cloned().unwrap_or(router)
            }
        };

        let peer = Arc::new(Peer::new(
            session.peer_id(),
            session.username().to_string(),
            room_id.clone(),
            session.outbox(),
        ));
        peer.transition(PeerState::Joining)?;

        let (peers, producers) = {
            let mut members = room.peers_mut().await;
            if let Err(e) = room.insert_peer(&mut members, peer.clone()) {
                drop(members);
                drop(pending);
                self.release_room(&room_id);
                return Err(e);
            }
            let peers: Vec<_> = members
                .values()
                .filter(|p| p.id() != peer.id())
                .map(|p| p.info())
                .collect();
            let producers: Vec<_> = router
                .producers()
                .into_iter()
                .filter(|p| p.peer_id() != peer.id() && !p.is_closed())
                .map(|p| p.info())
                .collect();
            (peers, producers)
        };

        peer.transition(PeerState::Joined)?;
        session.set_membership(Some(peer.clone()));
        drop(pending);

        room.broadcast_except(peer.id(), ServerNotification::PeerJoined(peer.info()))
            .await;

        info!(
            room_id = %room_id,
            peer_id = %peer.id(),
            peers = peers.len() + 1,
            "Peer joined room"
        );

        Ok(JoinRoomResponse {
            router_rtp_capabilities: router.rtp_capabilities().clone(),
            peers,
            producers,
        })
    }

    fn register_capabilities(
        &self,
        session: &Session,
        req: RegisterCapabilities,
    ) -> Result<(), VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        let (_, router) = self.room_and_router(&req.room_id)?;
        if router.rtp_capabilities().intersect(&req.rtp_capabilities).is_empty() {
            return Err(VoiceError::CapabilityLoadFailure(
                "no codec in common with the router".into(),
            ));
        }
        peer.set_rtp_capabilities(req.rtp_capabilities);
        debug!(peer_id = %peer.id(), "RTP capabilities registered");
        Ok(())
    }

    /// Leave the room. Only the first caller does the work.
    pub async fn leave_room(&self, session: &Session, peer: &Arc<Peer>) {
        if peer.transition(PeerState::Leaving).is_err() {
            return;
        }
        peer.cancel_token().cancel();
        let room_id = peer.room_id().clone();

        if let Some(room) = self.room(&room_id) {
            let report = room
                .router()
                .map(|router| router.close_peer(peer.id()))
                .unwrap_or_default();
            room.remove_peer(peer.id()).await;
            room.notify_closures(&report).await;
            room.broadcast_except(
                peer.id(),
                ServerNotification::PeerLeft {
                    peer_id: peer.id(),
                    username: peer.username().to_string(),
                },
            )
            .await;
            info!(
                room_id = %room_id,
                peer_id = %peer.id(),
                producers = report.producers.len(),
                consumers = report.consumers.len(),
                "Peer left room"
            );
        }

        let _ = peer.transition(PeerState::Left);
        session.clear_membership(peer);
        self.release_room(&room_id);
    }

    /// Drop the room and its router once nobody is in or entering it.
    fn release_room(&self, room_id: &RoomId) {
        let mut released = None;
        let removed = self.rooms.remove_if(room_id, |_, room| {
            if room.is_idle() {
                // Unregistered under the room entry lock so a new joiner
                // gets a fresh router.
                released = self.registry.unregister(room_id);
                true
            } else {
                false
            }
        });
        if removed.is_some() {
            if let Some(router) = released {
                router.close();
            }
            debug!(room_id = %room_id, "Released empty room");
        }
    }

    /// Per-room task turning router events into notifications.
    fn watch_router(self: &Arc<Self>, room: Arc<Room>, router: Arc<Router>) {
        let service: Weak<Self> = Arc::downgrade(self);
        let mut events = router.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = router.closed() => {
                        if let Some(service) = service.upgrade() {
                            service.on_router_closed(&room, &router).await;
                        }
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(RouterEvent::TransportClosed { transport_id, peer_id, reason, report }) => {
                            let Some(service) = service.upgrade() else { break };
                            service
                                .on_transport_closed(&room, transport_id, peer_id, reason, &report)
                                .await;
                        }
                        Ok(RouterEvent::RouterClosed { .. }) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(room_id = %room.id(), skipped, "Router events lagged");
                        }
                    }
                }
            }
        });
    }

    async fn on_transport_closed(
        &self,
        room: &Room,
        transport_id: TransportId,
        peer_id: PeerId,
        reason: String,
        report: &CloseReport,
    ) {
        if let Some(owner) = room.get_peer(peer_id).await {
            owner.clear_transport(transport_id);
            owner.notify(ServerNotification::TransportClosed {
                transport_id,
                reason,
            });
        }
        room.notify_closures(report).await;
    }

    /// The router died with its worker: close the room for everyone.
    async fn on_router_closed(&self, room: &Arc<Room>, router: &Arc<Router>) {
        let members: Vec<Arc<Peer>> = room.peers().await.values().cloned().collect();
        if members.is_empty() {
            return;
        }
        warn!(room_id = %room.id(), router_id = %router.id(), "Router closed under live room");

        router.close();
        for peer in members {
            peer.notify(ServerNotification::RoomClosed {
                room_id: room.id().clone(),
                reason: "media worker closed".into(),
            });
            if let Some(session) = self.sessions.get(peer.id()) {
                self.leave_room(&session, &peer).await;
            } else if peer.transition(PeerState::Leaving).is_ok() {
                peer.cancel_token().cancel();
                room.remove_peer(peer.id()).await;
                let _ = peer.transition(PeerState::Left);
            }
        }
        self.rooms
            .remove_if(room.id(), |_, current| Arc::ptr_eq(current, room));
        self.registry.discard(room.id(), router);
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    async fn create_transport(
        &self,
        session: &Session,
        req: CreateTransport,
    ) -> Result<TransportOptions, VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        let (_, router) = self.room_and_router(&req.room_id)?;
        if peer.transport(req.direction).is_some() {
            return Err(VoiceError::InvalidState(format!(
                "{} transport already exists",
                req.direction
            )));
        }

        let transport = router
            .create_webrtc_transport(peer.id(), req.direction)
            .await
            .map_err(VoiceError::TransportCreation)?;

        // Peer left while the transport was being created.
        if peer.is_cancelled() {
            router.close_transport(transport.id());
            return Err(VoiceError::InvalidState("peer left the room".into()));
        }
        if let Err(e) = peer.set_transport(req.direction, transport.id()) {
            router.close_transport(transport.id());
            return Err(e);
        }

        Ok(TransportOptions {
            id: transport.id(),
            direction: transport.direction(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates().to_vec(),
            dtls_parameters: transport.dtls_parameters(),
            ice_servers: self.config.ice_servers(),
        })
    }

    async fn connect_transport(
        &self,
        session: &Session,
        req: ConnectTransport,
    ) -> Result<(), VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        if !peer.owns_transport(req.transport_id) {
            return Err(VoiceError::TransportConnect(EngineError::TransportNotFound(
                req.transport_id,
            )));
        }
        let (_, router) = self.room_and_router(&req.room_id)?;
        router
            .connect_transport(req.transport_id, req.ice_parameters, req.dtls_parameters)
            .await
            .map_err(VoiceError::TransportConnect)
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    async fn produce(&self, session: &Session, req: Produce) -> Result<ProduceResponse, VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        let (room, router) = self.room_and_router(&req.room_id)?;
        if peer.transport(TransportDirection::Send) != Some(req.transport_id) {
            return Err(VoiceError::Produce("not this peer's send transport".into()));
        }

        let source = req
            .source
            .unwrap_or_else(|| TrackSource::infer(req.kind, &req.app_data));
        if source.kind() != req.kind {
            return Err(VoiceError::Produce(format!(
                "{source:?} is not a {} source",
                req.kind
            )));
        }
        if peer.producer(source).is_some() {
            return Err(VoiceError::Produce(format!("a {source:?} producer is already live")));
        }
        let quality = match source {
            TrackSource::ScreenVideo => Some(req.quality.unwrap_or_default()),
            _ => req.quality,
        };

        // Shared peer lock: joins wait until the announcement is out.
        let members = room.peers().await;
        let producer = router
            .produce(
                req.transport_id,
                ProduceRequest {
                    kind: req.kind,
                    source,
                    rtp_parameters: req.rtp_parameters,
                    app_data: req.app_data,
                    quality,
                },
            )
            .await
            .map_err(|e| VoiceError::Produce(e.to_string()))?;

        if peer.is_cancelled() {
            drop(members);
            let report = router.close_producer(producer.id());
            room.notify_closures(&report).await;
            return Err(VoiceError::InvalidState("peer left the room".into()));
        }
        if let Err(e) = peer.add_producer(source, producer.id()) {
            drop(members);
            router.close_producer(producer.id());
            return Err(e);
        }

        let announcement = ServerNotification::NewProducer(producer.info());
        for member in members.values().filter(|m| m.id() != peer.id()) {
            member.notify(announcement.clone());
        }
        drop(members);

        if matches!(source, TrackSource::ScreenVideo | TrackSource::Camera) {
            room.broadcast_except(
                peer.id(),
                ServerNotification::PeerMediaState {
                    peer_id: peer.id(),
                    state: peer.media_state(),
                },
            )
            .await;
        }

        info!(
            room_id = %req.room_id,
            peer_id = %peer.id(),
            producer_id = %producer.id(),
            source = ?source,
            "Producer published"
        );
        Ok(ProduceResponse { id: producer.id() })
    }

    async fn set_producer_paused(
        &self,
        session: &Session,
        req: ProducerRef,
        paused: bool,
    ) -> Result<(), VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        let source = peer
            .producer_source(req.producer_id)
            .ok_or(EngineError::ProducerNotFound(req.producer_id))?;
        let (room, router) = self.room_and_router(&req.room_id)?;

        let producer = if paused {
            router.pause_producer(req.producer_id).await?
        } else {
            router.resume_producer(req.producer_id).await?
        };

        let notification = if paused {
            ServerNotification::ProducerPaused {
                producer_id: producer.id(),
                peer_id: peer.id(),
            }
        } else {
            ServerNotification::ProducerResumed {
                producer_id: producer.id(),
                peer_id: peer.id(),
            }
        };
        room.broadcast_except(peer.id(), notification).await;

        if source == TrackSource::Microphone {
            let state = peer.update_media_state(|m| m.muted = paused);
            room.broadcast_except(
                peer.id(),
                ServerNotification::PeerMediaState {
                    peer_id: peer.id(),
                    state,
                },
            )
            .await;
        }
        Ok(())
    }

    async fn close_producer(
        &self,
        session: &Session,
        req: ProducerRef,
        expected: Option<TrackSource>,
    ) -> Result<(), VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        let source = peer
            .producer_source(req.producer_id)
            .ok_or(EngineError::ProducerNotFound(req.producer_id))?;
        if let Some(expected) = expected {
            let matches = match expected {
                TrackSource::ScreenVideo => source.is_screen(),
                other => other == source,
            };
            if !matches {
                return Err(VoiceError::InvalidRequest(format!(
                    "producer {} is a {source:?} producer",
                    req.producer_id
                )));
            }
        }
        let (room, router) = self.room_and_router(&req.room_id)?;

        let mut report = router.close_producer(req.producer_id);
        // Stopping a screen share also stops its audio.
        if expected == Some(TrackSource::ScreenVideo) {
            let companion = if source == TrackSource::ScreenVideo {
                TrackSource::ScreenAudio
            } else {
                TrackSource::ScreenVideo
            };
            if let Some(id) = peer.producer(companion) {
                let extra = router.close_producer(id);
                report.producers.extend(extra.producers);
                report.consumers.extend(extra.consumers);
            }
        }
        room.notify_closures(&report).await;
        debug!(peer_id = %peer.id(), producer_id = %req.producer_id, "Producer closed");
        Ok(())
    }

    async fn set_screen_share_quality(
        &self,
        session: &Session,
        req: SetScreenShareQuality,
    ) -> Result<(), VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        if peer.producer_source(req.producer_id) != Some(TrackSource::ScreenVideo) {
            return Err(VoiceError::InvalidRequest(format!(
                "producer {} is not a screen share",
                req.producer_id
            )));
        }
        let (room, router) = self.room_and_router(&req.room_id)?;
        router
            .set_producer_quality(req.producer_id, req.quality)
            .await?;
        room.broadcast_except(
            peer.id(),
            ServerNotification::ScreenShareQualityChanged {
                peer_id: peer.id(),
                producer_id: req.producer_id,
                quality: req.quality,
            },
        )
        .await;
        Ok(())
    }

    async fn set_media_state(&self, session: &Session, req: SetMediaState) -> Result<(), VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        let (room, _) = self.room_and_router(&req.room_id)?;
        let state = peer.update_media_state(|m| {
            if let Some(muted) = req.muted {
                m.muted = muted;
            }
            if let Some(deafened) = req.deafened {
                m.deafened = deafened;
            }
        });
        room.broadcast_except(
            peer.id(),
            ServerNotification::PeerMediaState {
                peer_id: peer.id(),
                state,
            },
        )
        .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    async fn consume(&self, session: &Session, req: Consume) -> Result<ConsumerOptions, VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        // Inline capabilities may narrow the registered ones, never replace
        // a missing registration.
        let registered = peer
            .rtp_capabilities()
            .ok_or(VoiceError::CapabilitiesNotRegistered)?;
        let (_, router) = self.room_and_router(&req.room_id)?;

        let recv = peer
            .transport(TransportDirection::Recv)
            .and_then(|id| router.transport(id))
            .filter(|t| t.is_connected())
            .ok_or(VoiceError::TransportNotReady)?;

        let refuse = |reason: &str| VoiceError::Consume {
            producer_id: req.producer_id,
            reason: reason.to_string(),
        };

        let producer = router
            .producer(req.producer_id)
            .filter(|p| !p.is_closed())
            .ok_or_else(|| refuse("producer not found"))?;
        if producer.peer_id() == peer.id() {
            return Err(refuse("cannot consume own producer"));
        }

        // Held until the consumer is recorded.
        let mut consumers = peer.consumers().lock().await;
        if let Some(existing) = consumers
            .get(&req.producer_id)
            .and_then(|id| router.consumer(*id))
            .filter(|c| !c.is_closed())
        {
            return Ok(Self::consumer_options(&existing));
        }

        let capabilities = match req.rtp_capabilities {
            Some(inline) => registered.intersect(&inline),
            None => registered,
        };
        if !router.can_consume(req.producer_id, &capabilities) {
            return Err(refuse("capabilities cannot receive this producer"));
        }
        let consumer = router
            .consume(recv.id(), req.producer_id, &capabilities)
            .await
            .map_err(|e| refuse(&e.to_string()))?;

        if peer.is_cancelled() {
            router.close_consumer(consumer.id());
            return Err(VoiceError::InvalidState("peer left the room".into()));
        }
        consumers.insert(req.producer_id, consumer.id());
        drop(consumers);

        debug!(
            peer_id = %peer.id(),
            consumer_id = %consumer.id(),
            producer_id = %req.producer_id,
            "Consumer created"
        );
        Ok(Self::consumer_options(&consumer))
    }

    fn consumer_options(consumer: &Consumer) -> ConsumerOptions {
        ConsumerOptions {
            id: consumer.id(),
            producer_id: consumer.producer_id(),
            peer_id: consumer.producer_peer_id(),
            kind: consumer.kind(),
            source: consumer.source(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            producer_paused: consumer.is_producer_paused(),
            app_data: consumer.app_data().clone(),
        }
    }

    async fn set_consumer_paused(
        &self,
        session: &Session,
        req: ConsumerRef,
        paused: bool,
    ) -> Result<(), VoiceError> {
        let peer = Self::joined_member(session, &req.room_id)?;
        let (_, router) = self.room_and_router(&req.room_id)?;
        let consumer = router
            .consumer(req.consumer_id)
            .filter(|c| c.peer_id() == peer.id())
            .ok_or(EngineError::ConsumerNotFound(req.consumer_id))?;
        if paused {
            router.pause_consumer(consumer.id()).await?;
        } else {
            router.resume_consumer(consumer.id()).await?;
        }
        Ok(())
    }
}
