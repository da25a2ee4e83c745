//! RTP capability and parameter descriptions
//!
//! Capabilities describe what an endpoint can send or receive; parameters
//! describe one concrete stream. Codec matching is case-insensitive on the
//! mime type and exact on clock rate and channel count.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MediaKind;

/// RTCP feedback mechanism (`nack`, `nack pli`, `ccm fir`, `goog-remb`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    /// Feedback type, e.g. `nack`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional parameter, e.g. `pli`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    /// Build a feedback entry.
    pub fn new(kind: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameter: parameter.into(),
        }
    }
}

/// A codec an endpoint supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    /// Audio or video.
    pub kind: MediaKind,
    /// e.g. `audio/opus`.
    pub mime_type: String,
    /// Payload type the endpoint prefers for this codec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    /// Clock rate in Hz.
    pub clock_rate: u32,
    /// Channel count (audio only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    /// Format parameters (`fmtp`).
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Supported RTCP feedback.
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// True when both sides describe the same codec.
    #[must_use]
    pub fn matches(&self, mime_type: &str, clock_rate: u32, channels: Option<u16>) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type)
            && self.clock_rate == clock_rate
            && (self.kind == MediaKind::Video || self.channels.unwrap_or(1) == channels.unwrap_or(1))
    }

    /// Render the format parameters as an SDP `fmtp` line.
    #[must_use]
    pub fn fmtp_line(&self) -> String {
        fmtp_line(&self.parameters)
    }
}

/// Everything an endpoint can receive (or a router can route).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    /// Supported codecs in preference order.
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// Codecs of `self` that `other` also supports, keeping `self`'s payload types.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let codecs = self
            .codecs
            .iter()
            .filter(|codec| {
                other
                    .codecs
                    .iter()
                    .any(|c| c.matches(&codec.mime_type, codec.clock_rate, codec.channels))
            })
            .cloned()
            .collect();
        Self { codecs }
    }

    /// Capability entry matching a concrete codec, if supported.
    #[must_use]
    pub fn find(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs
            .iter()
            .find(|c| c.matches(&codec.mime_type, codec.clock_rate, codec.channels))
    }

    /// First codec of the given kind.
    #[must_use]
    pub fn codec_for(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.kind == kind)
    }

    /// True if at least one codec of `kind` is supported.
    #[must_use]
    pub fn supports_kind(&self, kind: MediaKind) -> bool {
        self.codec_for(kind).is_some()
    }

    /// True if no codecs are listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

/// A codec negotiated for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// e.g. `video/VP8`.
    pub mime_type: String,
    /// Payload type carried in RTP headers.
    pub payload_type: u8,
    /// Clock rate in Hz.
    pub clock_rate: u32,
    /// Channel count (audio only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    /// Format parameters (`fmtp`).
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// RTCP feedback in use.
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Build stream parameters from a capability entry.
    #[must_use]
    pub fn from_capability(capability: &RtpCodecCapability, payload_type: u8) -> Self {
        Self {
            mime_type: capability.mime_type.clone(),
            payload_type,
            clock_rate: capability.clock_rate,
            channels: capability.channels,
            parameters: capability.parameters.clone(),
            rtcp_feedback: capability.rtcp_feedback.clone(),
        }
    }

    /// Media kind implied by the mime type.
    #[must_use]
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_mime(&self.mime_type)
    }

    /// Render the format parameters as an SDP `fmtp` line.
    #[must_use]
    pub fn fmtp_line(&self) -> String {
        fmtp_line(&self.parameters)
    }
}

/// Per-encoding limits and identifiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    /// SSRC of the encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    /// Maximum bitrate in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    /// Maximum frame rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_framerate: Option<u32>,
    /// Downscale factor relative to the capture resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
}

/// RTCP settings of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    /// Canonical name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    /// Reduced-size RTCP (RFC 5506).
    #[serde(default = "default_true")]
    pub reduced_size: bool,
}

impl Default for RtcpParameters {
    fn default() -> Self {
        Self {
            cname: None,
            reduced_size: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Parameters of one RTP stream (producer input or consumer output).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    /// Media section id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    /// Codecs, first entry is the media codec.
    pub codecs: Vec<RtpCodecParameters>,
    /// Encodings.
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    /// RTCP settings.
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// The media codec of the stream.
    #[must_use]
    pub fn codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }

    /// SSRC of the first encoding.
    #[must_use]
    pub fn ssrc(&self) -> Option<u32> {
        self.encodings.first().and_then(|e| e.ssrc)
    }
}

fn fmtp_line(parameters: &BTreeMap<String, Value>) -> String {
    parameters
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            preferred_payload_type: Some(111),
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::from([
                ("minptime".to_string(), Value::from(10)),
                ("useinbandfec".to_string(), Value::from(1)),
            ]),
            rtcp_feedback: vec![],
        }
    }

    fn vp8() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            preferred_payload_type: Some(96),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![RtcpFeedback::new("nack", "pli")],
        }
    }

    #[test]
    fn test_codec_match_is_case_insensitive() {
        assert!(vp8().matches("video/vp8", 90000, None));
        assert!(!vp8().matches("video/vp8", 48000, None));
        assert!(!opus().matches("audio/opus", 48000, Some(1)));
    }

    #[test]
    fn test_intersection_keeps_common_codecs() {
        let router = RtpCapabilities {
            codecs: vec![opus(), vp8()],
        };
        let audio_only = RtpCapabilities {
            codecs: vec![opus()],
        };

        let common = router.intersect(&audio_only);
        assert_eq!(common.codecs.len(), 1);
        assert!(common.supports_kind(MediaKind::Audio));
        assert!(!common.supports_kind(MediaKind::Video));

        let none = audio_only.intersect(&RtpCapabilities::default());
        assert!(none.is_empty());
    }

    #[test]
    fn test_fmtp_line() {
        assert_eq!(opus().fmtp_line(), "minptime=10;useinbandfec=1");
        assert_eq!(vp8().fmtp_line(), "");
    }

    #[test]
    fn test_parameters_wire_format() {
        let params = RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters::from_capability(&vp8(), 96)],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1234),
                max_bitrate: Some(3_000_000),
                ..Default::default()
            }],
            rtcp: RtcpParameters::default(),
        };

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["codecs"][0]["mimeType"], "video/VP8");
        assert_eq!(json["codecs"][0]["payloadType"], 96);
        assert_eq!(json["encodings"][0]["maxBitrate"], 3_000_000);
        assert_eq!(json["rtcp"]["reducedSize"], true);
        assert_eq!(params.ssrc(), Some(1234));
        assert_eq!(params.codec().and_then(RtpCodecParameters::kind), Some(MediaKind::Video));
    }
}
