//! Routers
//!
//! One router per room. The router owns the room's transport, producer and
//! consumer graph and guarantees that closing any node closes everything
//! that depends on it:
//!
//! - transport → its producers and consumers
//! - producer → every consumer of it
//!
//! Asynchronous engine notifications (ICE failure) are published on a
//! broadcast channel; router closure is observable through [`Router::closed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vc_common::ortc::rtc_codec_capability;
use vc_common::{
    AppData, ConsumerId, DtlsParameters, IceParameters, IceState, MediaKind, PeerId, ProducerId,
    Quality, RouterId, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TrackSource, TransportDirection,
    TransportId, TransportState,
};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::consumer::{Consumer, ConsumerOptions};
use super::error::EngineError;
use super::media::{spawn_rtp_reader, spawn_rtp_writer};
use super::producer::{Producer, ProducerOptions};
use super::transport::WebRtcTransport;
use super::worker::Worker;

/// Capacity of the router event channel.
const ROUTER_EVENT_CAPACITY: usize = 64;

/// Objects closed by one operation, in cascade order.
#[derive(Debug, Clone, Default)]
pub struct CloseReport {
    pub transports: Vec<Arc<WebRtcTransport>>,
    pub producers: Vec<Arc<Producer>>,
    pub consumers: Vec<Arc<Consumer>>,
}

impl CloseReport {
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

/// Events a router emits on its own.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A transport was closed by the engine: ICE failed or disconnected, or
    /// its handshake never completed.
    TransportClosed {
        transport_id: TransportId,
        peer_id: PeerId,
        reason: String,
        report: CloseReport,
    },
    /// The router closed, explicitly or because its worker died.
    RouterClosed { router_id: RouterId },
}

/// What a producer is created from.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub source: TrackSource,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
    pub quality: Option<Quality>,
}

#[derive(Debug, Default)]
struct RouterGraph {
    transports: HashMap<TransportId, Arc<WebRtcTransport>>,
    producers: HashMap<ProducerId, Arc<Producer>>,
    consumers: HashMap<ConsumerId, Arc<Consumer>>,
}

impl RouterGraph {
    fn close_consumer(&mut self, id: ConsumerId, report: &mut CloseReport) {
        let Some(consumer) = self.consumers.remove(&id) else {
            return;
        };
        if let Some(producer) = self.producers.get(&consumer.producer_id()) {
            producer.remove_consumer(id);
        }
        if consumer.close() {
            report.consumers.push(consumer);
        }
    }

    fn close_producer(&mut self, id: ProducerId, report: &mut CloseReport) {
        let Some(producer) = self.producers.remove(&id) else {
            return;
        };
        for consumer in producer.close() {
            self.consumers.remove(&consumer.id());
            if consumer.close() {
                report.consumers.push(consumer);
            }
        }
        report.producers.push(producer);
    }

    fn close_transport(&mut self, id: TransportId, report: &mut CloseReport) {
        let Some(transport) = self.transports.remove(&id) else {
            return;
        };
        transport.close();

        let producers: Vec<ProducerId> = self
            .producers
            .values()
            .filter(|p| p.transport_id() == id)
            .map(|p| p.id())
            .collect();
        for producer_id in producers {
            self.close_producer(producer_id, report);
        }

        let consumers: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.transport_id() == id)
            .map(|c| c.id())
            .collect();
        for consumer_id in consumers {
            self.close_consumer(consumer_id, report);
        }

        report.transports.push(transport);
    }
}

/// Media router of one room.
#[derive(Debug)]
pub struct Router {
    id: RouterId,
    worker: Arc<Worker>,
    rtp_capabilities: RtpCapabilities,
    graph: Mutex<RouterGraph>,
    events: broadcast::Sender<RouterEvent>,
    closed: CancellationToken,
    drained: AtomicBool,
}

/// Closes a transport whose handshake did not complete.
struct HandshakeGuard<'a> {
    router: &'a Router,
    transport_id: TransportId,
    armed: bool,
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.router
                .fail_transport(self.transport_id, "handshake failed".to_string());
        }
    }
}

impl Router {
    pub(crate) fn new(worker: Arc<Worker>, closed: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(ROUTER_EVENT_CAPACITY);
        Self {
            id: RouterId::new(),
            worker,
            rtp_capabilities: Self::media_codecs(),
            graph: Mutex::new(RouterGraph::default()),
            events,
            closed,
            drained: AtomicBool::new(false),
        }
    }

    /// The fixed codec set: Opus for audio, VP8 for video.
    pub fn media_codecs() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    preferred_payload_type: Some(111),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: [
                        ("minptime".to_string(), 10.into()),
                        ("useinbandfec".to_string(), 1.into()),
                    ]
                    .into_iter()
                    .collect(),
                    rtcp_feedback: vec![],
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: MIME_TYPE_VP8.to_string(),
                    preferred_payload_type: Some(96),
                    clock_rate: 90000,
                    channels: None,
                    parameters: Default::default(),
                    rtcp_feedback: vec![
                        RtcpFeedback::new("goog-remb", ""),
                        RtcpFeedback::new("ccm", "fir"),
                        RtcpFeedback::new("nack", ""),
                        RtcpFeedback::new("nack", "pli"),
                    ],
                },
            ],
        }
    }

    pub const fn id(&self) -> RouterId {
        self.id
    }

    /// Worker hosting the router.
    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }

    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the router closes (explicitly or with its worker).
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    fn graph(&self) -> MutexGuard<'_, RouterGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(EngineError::RouterClosed(self.id))
        } else {
            Ok(())
        }
    }

    pub fn transport(&self, id: TransportId) -> Option<Arc<WebRtcTransport>> {
        self.graph().transports.get(&id).cloned()
    }

    pub fn producer(&self, id: ProducerId) -> Option<Arc<Producer>> {
        self.graph().producers.get(&id).cloned()
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<Consumer>> {
        self.graph().consumers.get(&id).cloned()
    }

    /// Transports owned by a peer.
    pub fn transports_of(&self, peer_id: PeerId) -> Vec<Arc<WebRtcTransport>> {
        self.graph()
            .transports
            .values()
            .filter(|t| t.peer_id() == peer_id)
            .cloned()
            .collect()
    }

    /// All live producers.
    pub fn producers(&self) -> Vec<Arc<Producer>> {
        self.graph().producers.values().cloned().collect()
    }

    /// Live consumers of a producer.
    pub fn consumers_of(&self, producer_id: ProducerId) -> Vec<Arc<Consumer>> {
        self.graph()
            .consumers
            .values()
            .filter(|c| c.producer_id() == producer_id)
            .cloned()
            .collect()
    }

    /// Create a transport for `peer_id`, bound to the worker's listen IP.
    /// Fatal ICE states reported by its agent close it through
    /// [`Router::handle_ice_state`].
    pub async fn create_webrtc_transport(
        self: &Arc<Self>,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<Arc<WebRtcTransport>, EngineError> {
        self.ensure_open()?;
        let transport =
            Arc::new(WebRtcTransport::new(self.worker.clone(), peer_id, direction).await?);

        let router: Weak<Self> = Arc::downgrade(self);
        let transport_id = transport.id();
        transport.on_ice_state(move |state| {
            if let Some(router) = router.upgrade() {
                router.handle_ice_state(transport_id, state);
            }
        });

        // Router may have closed while candidates were gathered.
        let inserted = {
            let mut graph = self.graph();
            let open = !self.is_closed();
            if open {
                graph.transports.insert(transport.id(), transport.clone());
            }
            open
        };
        if !inserted {
            transport.close();
            return Err(EngineError::RouterClosed(self.id));
        }

        debug!(
            router_id = %self.id,
            transport_id = %transport.id(),
            peer_id = %peer_id,
            direction = %direction,
            "Transport created"
        );
        Ok(transport)
    }

    /// Run ICE and the DTLS handshake with the client's parameters. A failed
    /// or timed-out handshake closes the transport.
    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        let transport = self
            .transport(transport_id)
            .ok_or(EngineError::TransportNotFound(transport_id))?;
        // Also closes the transport if this future is dropped mid-handshake.
        let mut guard = HandshakeGuard {
            router: self,
            transport_id,
            armed: true,
        };
        match transport.connect(ice_parameters, dtls_parameters).await {
            Err(e @ (EngineError::HandshakeFailed { .. } | EngineError::HandshakeTimeout(_))) => {
                warn!(
                    router_id = %self.id,
                    transport_id = %transport_id,
                    error = %e,
                    "Handshake failed, closing transport"
                );
                Err(e)
            }
            other => {
                guard.armed = false;
                other
            }
        }
    }

    /// Create a producer on a connected send transport.
    pub async fn produce(
        &self,
        transport_id: TransportId,
        request: ProduceRequest,
    ) -> Result<Arc<Producer>, EngineError> {
        self.ensure_open()?;
        let transport = self
            .transport(transport_id)
            .ok_or(EngineError::TransportNotFound(transport_id))?;
        if transport.direction() != TransportDirection::Send {
            return Err(EngineError::WrongDirection {
                id: transport_id,
                expected: TransportDirection::Send,
            });
        }
        let state = transport.state();
        if state != TransportState::Connected {
            return Err(EngineError::InvalidTransportState {
                id: transport_id,
                state,
            });
        }

        let codec = request
            .rtp_parameters
            .codec()
            .ok_or_else(|| EngineError::InvalidRtpParameters("no codecs".to_string()))?;
        if codec.kind() != Some(request.kind) {
            return Err(EngineError::UnsupportedCodec(format!(
                "{} is not a {} codec",
                codec.mime_type, request.kind
            )));
        }
        if self.rtp_capabilities.find(codec).is_none() {
            return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
        }
        let ssrc = request
            .rtp_parameters
            .ssrc()
            .ok_or_else(|| EngineError::InvalidRtpParameters("no ssrc".to_string()))?;
        let receiver = transport.receive(request.kind, codec, ssrc).await?;

        let producer = Arc::new(Producer::new(ProducerOptions {
            peer_id: transport.peer_id(),
            transport_id,
            kind: request.kind,
            source: request.source,
            rtp_parameters: request.rtp_parameters,
            app_data: request.app_data,
            quality: request.quality,
        }));

        // Transport may have closed while the receiver was set up.
        let inserted = {
            let mut graph = self.graph();
            let present = graph.transports.contains_key(&transport_id);
            if present {
                graph.producers.insert(producer.id(), producer.clone());
            }
            present
        };
        if !inserted {
            producer.close();
            let _ = receiver.stop().await;
            return Err(EngineError::TransportNotFound(transport_id));
        }
        spawn_rtp_reader(producer.clone(), receiver);

        info!(
            router_id = %self.id,
            producer_id = %producer.id(),
            peer_id = %producer.peer_id(),
            kind = %producer.kind(),
            source = ?producer.source(),
            "Producer created"
        );
        Ok(producer)
    }

    /// Whether `rtp_capabilities` can receive the producer.
    pub fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producer(producer_id) else {
            return false;
        };
        if producer.is_closed() {
            return false;
        }
        producer
            .rtp_parameters()
            .codec()
            .is_some_and(|codec| rtp_capabilities.find(codec).is_some())
    }

    /// Create a paused consumer of `producer_id` on a receive transport.
    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<Consumer>, EngineError> {
        self.ensure_open()?;
        let transport = self
            .transport(transport_id)
            .ok_or(EngineError::TransportNotFound(transport_id))?;
        if transport.direction() != TransportDirection::Recv {
            return Err(EngineError::WrongDirection {
                id: transport_id,
                expected: TransportDirection::Recv,
            });
        }
        let producer = self
            .producer(producer_id)
            .ok_or(EngineError::ProducerNotFound(producer_id))?;
        if !self.can_consume(producer_id, rtp_capabilities) {
            return Err(EngineError::CannotConsume(producer_id));
        }

        let producer_params = producer.rtp_parameters();
        let producer_codec = producer_params
            .codec()
            .ok_or_else(|| EngineError::InvalidRtpParameters("producer has no codec".into()))?;
        let router_codec = self
            .rtp_capabilities
            .find(producer_codec)
            .ok_or_else(|| EngineError::UnsupportedCodec(producer_codec.mime_type.clone()))?;
        let payload_type = rtp_capabilities
            .find(producer_codec)
            .and_then(|c| c.preferred_payload_type)
            .or(router_codec.preferred_payload_type)
            .unwrap_or(producer_codec.payload_type);

        let rtp_parameters = RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters::from_capability(router_codec, payload_type)],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::random::<u32>()),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters {
                cname: producer_params.rtcp.cname.clone(),
                reduced_size: true,
            },
        };

        let consumer = Arc::new(Consumer::new(ConsumerOptions {
            peer_id: transport.peer_id(),
            producer_id,
            producer_peer_id: producer.peer_id(),
            transport_id,
            kind: producer.kind(),
            source: producer.source(),
            rtp_parameters,
            app_data: producer.app_data().clone(),
            producer_paused: producer.is_paused(),
            transport_state: transport.subscribe_state(),
        }));

        let codec = consumer
            .rtp_parameters()
            .codec()
            .cloned()
            .ok_or_else(|| EngineError::InvalidRtpParameters("consumer has no codec".into()))?;
        let track = Arc::new(TrackLocalStaticRTP::new(
            rtc_codec_capability(&codec),
            consumer.id().to_string(),
            producer.peer_id().to_string(),
        ));
        let sender = transport
            .send(consumer.kind(), track.clone(), &codec, consumer.ssrc())
            .await?;
        let packets = consumer
            .take_receiver()
            .ok_or_else(|| EngineError::InvalidRtpParameters("consumer queue taken".into()))?;

        // Transport or producer may have closed while the sender was set up.
        let missing = {
            let mut graph = self.graph();
            if !graph.transports.contains_key(&transport_id) {
                Some(EngineError::TransportNotFound(transport_id))
            } else if !graph.producers.contains_key(&producer_id) {
                Some(EngineError::ProducerNotFound(producer_id))
            } else {
                graph.consumers.insert(consumer.id(), consumer.clone());
                producer.add_consumer(consumer.clone());
                None
            }
        };
        if let Some(e) = missing {
            consumer.close();
            let _ = sender.stop().await;
            return Err(e);
        }
        spawn_rtp_writer(consumer.clone(), packets, track, sender);

        debug!(
            router_id = %self.id,
            consumer_id = %consumer.id(),
            producer_id = %producer_id,
            peer_id = %consumer.peer_id(),
            "Consumer created"
        );
        Ok(consumer)
    }

    pub async fn pause_producer(&self, id: ProducerId) -> Result<Arc<Producer>, EngineError> {
        let producer = self.producer(id).ok_or(EngineError::ProducerNotFound(id))?;
        producer.pause();
        Ok(producer)
    }

    pub async fn resume_producer(&self, id: ProducerId) -> Result<Arc<Producer>, EngineError> {
        let producer = self.producer(id).ok_or(EngineError::ProducerNotFound(id))?;
        producer.resume();
        Ok(producer)
    }

    /// Change a producer's quality tier without recreating it.
    pub async fn set_producer_quality(
        &self,
        id: ProducerId,
        quality: Quality,
    ) -> Result<Arc<Producer>, EngineError> {
        let producer = self.producer(id).ok_or(EngineError::ProducerNotFound(id))?;
        producer.set_quality(quality);
        Ok(producer)
    }

    pub async fn pause_consumer(&self, id: ConsumerId) -> Result<Arc<Consumer>, EngineError> {
        let consumer = self.consumer(id).ok_or(EngineError::ConsumerNotFound(id))?;
        consumer.pause();
        Ok(consumer)
    }

    pub async fn resume_consumer(&self, id: ConsumerId) -> Result<Arc<Consumer>, EngineError> {
        let consumer = self.consumer(id).ok_or(EngineError::ConsumerNotFound(id))?;
        consumer.resume();
        Ok(consumer)
    }

    /// Close a producer and every consumer of it.
    pub fn close_producer(&self, id: ProducerId) -> CloseReport {
        let mut report = CloseReport::default();
        self.graph().close_producer(id, &mut report);
        report
    }

    pub fn close_consumer(&self, id: ConsumerId) -> CloseReport {
        let mut report = CloseReport::default();
        self.graph().close_consumer(id, &mut report);
        report
    }

    /// Close a transport with full cascade.
    pub fn close_transport(&self, id: TransportId) -> CloseReport {
        let mut report = CloseReport::default();
        self.graph().close_transport(id, &mut report);
        report
    }

    /// Close every transport (and stray object) owned by a peer.
    pub fn close_peer(&self, peer_id: PeerId) -> CloseReport {
        let mut report = CloseReport::default();
        let mut graph = self.graph();

        let transports: Vec<TransportId> = graph
            .transports
            .values()
            .filter(|t| t.peer_id() == peer_id)
            .map(|t| t.id())
            .collect();
        for transport_id in transports {
            graph.close_transport(transport_id, &mut report);
        }
        report
    }

    /// ICE agent callback. Fatal states close the transport and cascade.
    pub fn handle_ice_state(&self, transport_id: TransportId, state: IceState) -> CloseReport {
        if !state.is_fatal() {
            debug!(transport_id = %transport_id, state = ?state, "ICE state changed");
            return CloseReport::default();
        }
        let report = self.fail_transport(transport_id, format!("ice {state:?}").to_lowercase());
        warn!(
            router_id = %self.id,
            transport_id = %transport_id,
            state = ?state,
            producers = report.producers.len(),
            consumers = report.consumers.len(),
            "Transport closed after ICE failure"
        );
        report
    }

    /// Close a transport the engine gave up on and announce it.
    fn fail_transport(&self, transport_id: TransportId, reason: String) -> CloseReport {
        let Some(peer_id) = self.transport(transport_id).map(|t| t.peer_id()) else {
            return CloseReport::default();
        };
        let report = self.close_transport(transport_id);
        let _ = self.events.send(RouterEvent::TransportClosed {
            transport_id,
            peer_id,
            reason,
            report: report.clone(),
        });
        report
    }

    /// Close the router and everything in it.
    pub fn close(&self) -> CloseReport {
        self.closed.cancel();
        let mut report = CloseReport::default();
        if self.drained.swap(true, Ordering::AcqRel) {
            return report;
        }

        let mut graph = self.graph();
        let transports: Vec<TransportId> = graph.transports.keys().copied().collect();
        for transport_id in transports {
            graph.close_transport(transport_id, &mut report);
        }
        drop(graph);

        self.worker.router_closed();
        let _ = self.events.send(RouterEvent::RouterClosed { router_id: self.id });
        info!(router_id = %self.id, worker_id = self.worker.id(), "Router closed");
        report
    }
}
