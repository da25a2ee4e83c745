//! Device Capabilities
//!
//! What this client can encode and decode, negotiated against the router's
//! capabilities on join.

use vc_common::{
    MediaKind, Quality, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TrackSource,
};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};

use crate::error::SessionError;

/// Payload type used when a capability carries no preference.
const FALLBACK_AUDIO_PT: u8 = 111;
const FALLBACK_VIDEO_PT: u8 = 96;

/// Negotiated codec set for one room.
#[derive(Debug, Clone)]
pub struct Device {
    rtp_capabilities: RtpCapabilities,
}

impl Device {
    /// Codecs this client supports: Opus and VP8.
    pub fn local_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    preferred_payload_type: Some(FALLBACK_AUDIO_PT),
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
                    preferred_payload_type: Some(FALLBACK_VIDEO_PT),
                    clock_rate: 90000,
                    channels: None,
                    parameters: Default::default(),
                    rtcp_feedback: vec![
                        RtcpFeedback::new("nack", ""),
                        RtcpFeedback::new("nack", "pli"),
                        RtcpFeedback::new("ccm", "fir"),
                        RtcpFeedback::new("goog-remb", ""),
                    ],
                },
            ],
        }
    }

    /// Intersect the router's capabilities with the local ones.
    ///
    /// The router's payload types win so produced streams match what the
    /// router forwards.
    pub fn load(
        router_capabilities: &RtpCapabilities,
        local_capabilities: &RtpCapabilities,
    ) -> Result<Self, SessionError> {
        let rtp_capabilities = router_capabilities.intersect(local_capabilities);
        if rtp_capabilities.is_empty() {
            return Err(SessionError::CapabilityLoadFailure(
                "no codec in common with the router".into(),
            ));
        }
        Ok(Self { rtp_capabilities })
    }

    /// Negotiated capabilities, registered with the server after join.
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.rtp_capabilities.supports_kind(kind)
    }

    /// Send parameters for a local track.
    ///
    /// Screen video carries the quality tier's bitrate and frame-rate caps
    /// in its encoding.
    pub fn send_parameters(
        &self,
        source: TrackSource,
        ssrc: u32,
        cname: &str,
        quality: Option<Quality>,
    ) -> Result<RtpParameters, SessionError> {
        let kind = source.kind();
        let capability = self.rtp_capabilities.codec_for(kind).ok_or_else(|| {
            SessionError::ProduceFailure(format!("no negotiated {kind} codec"))
        })?;
        let payload_type = capability.preferred_payload_type.unwrap_or(match kind {
            MediaKind::Audio => FALLBACK_AUDIO_PT,
            MediaKind::Video => FALLBACK_VIDEO_PT,
        });

        let mut encoding = RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..RtpEncodingParameters::default()
        };
        if source == TrackSource::ScreenVideo {
            apply_quality(&mut encoding, quality.unwrap_or_default());
        }

        Ok(RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters::from_capability(capability, payload_type)],
            encodings: vec![encoding],
            rtcp: RtcpParameters {
                cname: Some(cname.to_string()),
                reduced_size: true,
            },
        })
    }
}

/// Cap an encoding at a screen-share quality tier.
pub fn apply_quality(encoding: &mut RtpEncodingParameters, quality: Quality) {
    encoding.max_bitrate = Some(quality.max_bitrate());
    encoding.max_framerate = Some(quality.max_fps());
}
