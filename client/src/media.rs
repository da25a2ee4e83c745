//! Local Capture and Remote Playback
//!
//! The session controller never touches capture or output devices directly.
//! A [`MediaDevices`] implementation hands out [`LocalTrack`]s and a
//! [`PlaybackSink`] renders remote tracks keyed by producer id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vc_common::ortc::MediaReceiver;
use vc_common::protocol::ConsumerOptions;
use vc_common::{
    ConsumerId, MediaKind, PeerId, ProducerId, Quality, RtpEncodingParameters, RtpParameters,
    TrackSource,
};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Where a remote track is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Audio,
    Camera,
    Screen,
}

impl Surface {
    /// Screen sources (video and system audio) render on the screen surface.
    pub const fn for_source(source: TrackSource) -> Self {
        match source {
            TrackSource::Microphone => Self::Audio,
            TrackSource::Camera => Self::Camera,
            TrackSource::ScreenVideo | TrackSource::ScreenAudio => Self::Screen,
        }
    }
}

/// Capture could not start.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Device unavailable: {0}")]
    Unavailable(String),
}

/// A captured local track.
///
/// The capture backend writes encoded RTP into [`LocalTrack::rtp_track`],
/// watches [`LocalTrack::subscribe_quality`] to retune its encoder and
/// releases the device once [`LocalTrack::stopped`] resolves.
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    ssrc: u32,
    rtp_track: Arc<TrackLocalStaticRTP>,
    enabled: AtomicBool,
    quality: watch::Sender<Option<Quality>>,
    stopped: CancellationToken,
}

impl LocalTrack {
    pub fn new(source: TrackSource, quality: Option<Quality>) -> Self {
        let id = format!("{}-{}", source_label(source), Uuid::new_v4().simple());
        let rtp_track = Arc::new(TrackLocalStaticRTP::new(
            codec_capability(source.kind()),
            id.clone(),
            "vc-local".to_string(),
        ));
        let (quality, _) = watch::channel(quality);
        Self {
            id,
            source,
            ssrc: rand::random(),
            rtp_track,
            enabled: AtomicBool::new(true),
            quality,
            stopped: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn source(&self) -> TrackSource {
        self.source
    }

    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// RTP sink shared with peer connections.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.rtp_track.clone()
    }

    pub fn quality(&self) -> Option<Quality> {
        *self.quality.borrow()
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<Option<Quality>> {
        self.quality.subscribe()
    }

    /// Switch quality tier and return the encoding limits now in effect.
    pub fn apply_quality(&self, quality: Quality) -> RtpEncodingParameters {
        self.quality.send_replace(Some(quality));
        let mut encoding = RtpEncodingParameters {
            ssrc: Some(self.ssrc),
            ..RtpEncodingParameters::default()
        };
        crate::device::apply_quality(&mut encoding, quality);
        encoding
    }

    /// Disabled tracks send silence or black frames.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Stop capture. Idempotent.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once the track has been stopped.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("ssrc", &self.ssrc)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

const fn source_label(source: TrackSource) -> &'static str {
    match source {
        TrackSource::Microphone => "mic",
        TrackSource::Camera => "camera",
        TrackSource::ScreenVideo => "screen",
        TrackSource::ScreenAudio => "screen-audio",
    }
}

/// Codec capability a local track is created with.
pub(crate) fn codec_capability(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// Capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Start capturing `source`. Screen video starts at `quality`.
    async fn acquire(
        &self,
        source: TrackSource,
        quality: Option<Quality>,
    ) -> Result<Arc<LocalTrack>, CaptureError>;
}

/// A consumed remote track handed to playback.
///
/// Playback reads RTP from [`MediaReceiver::track`].
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub producer_id: ProducerId,
    pub consumer_id: ConsumerId,
    /// Peer that produces the track.
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub source: TrackSource,
    pub rtp_parameters: RtpParameters,
    pub media: Arc<MediaReceiver>,
}

impl RemoteTrack {
    pub fn new(options: &ConsumerOptions, media: MediaReceiver) -> Self {
        Self {
            producer_id: options.producer_id,
            consumer_id: options.id,
            peer_id: options.peer_id,
            kind: options.kind,
            source: options.source,
            rtp_parameters: options.rtp_parameters.clone(),
            media: Arc::new(media),
        }
    }
}

/// Two handles are equal when they describe the same consumer.
impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.consumer_id == other.consumer_id
            && self.producer_id == other.producer_id
            && self.peer_id == other.peer_id
            && self.kind == other.kind
            && self.source == other.source
            && self.rtp_parameters == other.rtp_parameters
    }
}

/// Output backend. Elements are keyed by producer id.
pub trait PlaybackSink: Send + Sync {
    fn attach(&self, track: RemoteTrack, surface: Surface);
    fn detach(&self, producer_id: ProducerId);
    /// Silence all output (deafen).
    fn set_muted(&self, muted: bool);
}
