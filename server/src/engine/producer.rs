//! Producers
//!
//! Inbound media of one track. Incoming RTP is fanned out to every consumer
//! of the producer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use vc_common::{
    AppData, ConsumerId, MediaKind, PeerId, ProducerId, ProducerInfo, Quality,
    RtpEncodingParameters, RtpParameters, TrackSource, TransportId,
};
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::Unmarshal;

use super::consumer::Consumer;
use super::error::EngineError;

/// Ingest counters.
#[derive(Debug, Default)]
pub struct ProducerStats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_discarded: AtomicU64,
}

/// A published track.
#[derive(Debug)]
pub struct Producer {
    id: ProducerId,
    peer_id: PeerId,
    transport_id: TransportId,
    kind: MediaKind,
    source: TrackSource,
    rtp_parameters: Mutex<RtpParameters>,
    app_data: AppData,
    quality: Mutex<Option<Quality>>,
    paused: AtomicBool,
    closed: AtomicBool,
    ended: CancellationToken,
    consumers: DashMap<ConsumerId, Arc<Consumer>>,
    stats: ProducerStats,
}

pub(crate) struct ProducerOptions {
    pub peer_id: PeerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub source: TrackSource,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
    pub quality: Option<Quality>,
}

impl Producer {
    pub(crate) fn new(options: ProducerOptions) -> Self {
        let producer = Self {
            id: ProducerId::new(),
            peer_id: options.peer_id,
            transport_id: options.transport_id,
            kind: options.kind,
            source: options.source,
            rtp_parameters: Mutex::new(options.rtp_parameters),
            app_data: options.app_data,
            quality: Mutex::new(None),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ended: CancellationToken::new(),
            consumers: DashMap::new(),
            stats: ProducerStats::default(),
        };
        if let Some(quality) = options.quality {
            producer.set_quality(quality);
        }
        producer
    }

    pub const fn id(&self) -> ProducerId {
        self.id
    }

    /// Owner of the producer.
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub const fn transport_id(&self) -> TransportId {
        self.transport_id
    }

    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    pub const fn source(&self) -> TrackSource {
        self.source
    }

    pub const fn app_data(&self) -> &AppData {
        &self.app_data
    }

    pub fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn quality(&self) -> Option<Quality> {
        *self.quality.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the producer is closed.
    pub async fn ended(&self) {
        self.ended.cancelled().await;
    }

    pub const fn stats(&self) -> &ProducerStats {
        &self.stats
    }

    /// Number of live consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Announcement payload for other room members.
    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            producer_id: self.id,
            peer_id: self.peer_id,
            kind: self.kind,
            source: self.source,
            app_data: self.app_data.clone(),
            paused: self.is_paused(),
        }
    }

    /// Apply a quality tier to the encoding limits in place.
    pub(crate) fn set_quality(&self, quality: Quality) {
        *self.quality.lock().unwrap_or_else(PoisonError::into_inner) = Some(quality);
        let mut params = self
            .rtp_parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if params.encodings.is_empty() {
            params.encodings.push(RtpEncodingParameters::default());
        }
        for encoding in &mut params.encodings {
            encoding.max_bitrate = Some(quality.max_bitrate());
            encoding.max_framerate = Some(quality.max_fps());
        }
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        for consumer in &self.consumers {
            consumer.set_producer_paused(true);
        }
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        for consumer in &self.consumers {
            consumer.set_producer_paused(false);
        }
    }

    pub(crate) fn add_consumer(&self, consumer: Arc<Consumer>) {
        self.consumers.insert(consumer.id(), consumer);
    }

    pub(crate) fn remove_consumer(&self, id: ConsumerId) {
        self.consumers.remove(&id);
    }

    /// Mark closed and hand back the consumers that referenced it.
    pub(crate) fn close(&self) -> Vec<Arc<Consumer>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.ended.cancel();
        let consumers: Vec<Arc<Consumer>> =
            self.consumers.iter().map(|c| c.value().clone()).collect();
        self.consumers.clear();
        consumers
    }

    /// Feed one parsed RTP packet. Returns how many consumers received it.
    pub fn receive_rtp(&self, packet: &Packet) -> usize {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);

        if self.is_closed() || self.is_paused() {
            self.stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        self.consumers
            .iter()
            .filter(|consumer| consumer.send(packet))
            .count()
    }

    /// Parse a raw datagram and forward it.
    pub fn receive_datagram(&self, mut datagram: &[u8]) -> Result<usize, EngineError> {
        let packet = Packet::unmarshal(&mut datagram)?;
        Ok(self.receive_rtp(&packet))
    }
}
