//! Consumers
//!
//! A consumer forwards one remote producer to one subscriber. It starts
//! paused and only forwards while it is resumed, its producer is resumed
//! and its transport is connected. Slow subscribers drop packets instead of
//! blocking the producer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use vc_common::{
    AppData, ConsumerId, MediaKind, PeerId, ProducerId, RtpParameters, TrackSource, TransportId,
    TransportState,
};
use webrtc::rtp::packet::Packet;

/// Packets buffered per consumer before new ones are dropped.
pub const CONSUMER_PACKET_CHANNEL_CAPACITY: usize = 256;

/// Forwarding counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub packets_forwarded: AtomicU64,
    pub packets_dropped: AtomicU64,
}

/// Subscription of one peer to one remote producer.
#[derive(Debug)]
pub struct Consumer {
    id: ConsumerId,
    peer_id: PeerId,
    producer_id: ProducerId,
    producer_peer_id: PeerId,
    transport_id: TransportId,
    kind: MediaKind,
    source: TrackSource,
    rtp_parameters: RtpParameters,
    app_data: AppData,
    ssrc: u32,
    payload_type: u8,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    closed: AtomicBool,
    ended: CancellationToken,
    transport_state: watch::Receiver<TransportState>,
    tx: mpsc::Sender<Packet>,
    rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    stats: ConsumerStats,
}

pub(crate) struct ConsumerOptions {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub producer_peer_id: PeerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub source: TrackSource,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
    pub producer_paused: bool,
    pub transport_state: watch::Receiver<TransportState>,
}

impl Consumer {
    pub(crate) fn new(options: ConsumerOptions) -> Self {
        let (tx, rx) = mpsc::channel(CONSUMER_PACKET_CHANNEL_CAPACITY);
        let ssrc = options.rtp_parameters.ssrc().unwrap_or_default();
        let payload_type = options
            .rtp_parameters
            .codec()
            .map(|c| c.payload_type)
            .unwrap_or_default();

        Self {
            id: ConsumerId::new(),
            peer_id: options.peer_id,
            producer_id: options.producer_id,
            producer_peer_id: options.producer_peer_id,
            transport_id: options.transport_id,
            kind: options.kind,
            source: options.source,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
            ssrc,
            payload_type,
            paused: AtomicBool::new(true),
            producer_paused: AtomicBool::new(options.producer_paused),
            closed: AtomicBool::new(false),
            ended: CancellationToken::new(),
            transport_state: options.transport_state,
            tx,
            rx: Mutex::new(Some(rx)),
            stats: ConsumerStats::default(),
        }
    }

    pub const fn id(&self) -> ConsumerId {
        self.id
    }

    /// Subscribing peer.
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub const fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    /// Owner of the consumed producer.
    pub const fn producer_peer_id(&self) -> PeerId {
        self.producer_peer_id
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

    pub const fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub const fn app_data(&self) -> &AppData {
        &self.app_data
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the consumer is closed.
    pub async fn ended(&self) {
        self.ended.cancelled().await;
    }

    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub const fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Take the outbound packet stream. Only the first caller gets it; the
    /// router hands it to the RTP writer when the consumer is created.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<Packet>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub(crate) fn set_producer_paused(&self, paused: bool) {
        self.producer_paused.store(paused, Ordering::Release);
    }

    /// Mark closed. Returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ended.cancel();
        true
    }

    fn can_forward(&self) -> bool {
        !self.is_closed()
            && !self.is_paused()
            && !self.is_producer_paused()
            && *self.transport_state.borrow() == TransportState::Connected
    }

    /// Forward one packet, rewriting SSRC and payload type.
    pub(crate) fn send(&self, packet: &Packet) -> bool {
        if !self.can_forward() {
            return false;
        }
        let mut out = packet.clone();
        out.header.ssrc = self.ssrc;
        out.header.payload_type = self.payload_type;

        if self.tx.try_send(out).is_ok() {
            self.stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}
