//! Media kinds, track sources and screen-share quality tiers.

use serde::{Deserialize, Serialize};

/// Free-form application data attached to producers (e.g. `{"screenShare": true}`).
pub type AppData = serde_json::Map<String, serde_json::Value>;

/// The kind of media a producer or consumer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track (microphone, screen audio).
    Audio,
    /// Video track (camera, screen share).
    Video,
}

impl MediaKind {
    /// Derive the kind from a codec mime type such as `audio/opus`.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let prefix = mime_type.split('/').next()?;
        if prefix.eq_ignore_ascii_case("audio") {
            Some(Self::Audio)
        } else if prefix.eq_ignore_ascii_case("video") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// The source of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    /// Microphone audio from the user.
    Microphone,
    /// Video from the user's camera.
    Camera,
    /// Video from screen sharing.
    ScreenVideo,
    /// Audio from screen sharing (system audio).
    ScreenAudio,
}

impl TrackSource {
    /// Returns the kind of media for this track source.
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Microphone | Self::ScreenAudio => MediaKind::Audio,
            Self::ScreenVideo | Self::Camera => MediaKind::Video,
        }
    }

    /// Returns true for both screen-share sources.
    #[must_use]
    pub const fn is_screen(&self) -> bool {
        matches!(self, Self::ScreenVideo | Self::ScreenAudio)
    }

    /// Infer the source of a producer from its kind and `appData`.
    ///
    /// Producers flagged with `screenShare: true` are screen sources,
    /// everything else is microphone or camera.
    #[must_use]
    pub fn infer(kind: MediaKind, app_data: &AppData) -> Self {
        let screen = app_data
            .get("screenShare")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        match (kind, screen) {
            (MediaKind::Audio, false) => Self::Microphone,
            (MediaKind::Audio, true) => Self::ScreenAudio,
            (MediaKind::Video, false) => Self::Camera,
            (MediaKind::Video, true) => Self::ScreenVideo,
        }
    }

    /// `appData` a client attaches when producing this source.
    #[must_use]
    pub fn app_data(&self) -> AppData {
        let mut data = AppData::new();
        if self.is_screen() {
            data.insert("screenShare".into(), serde_json::Value::Bool(true));
        }
        data.insert(
            "source".into(),
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        );
        data
    }
}

/// Video quality tier for screen sharing.
///
/// Each tier defines resolution, frame rate, and bitrate constraints
/// suitable for different network conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// 480p @ 15fps, 750 kbps - fallback for poor connections.
    Low,
    /// 720p @ 30fps, 2 Mbps - default quality.
    #[default]
    Medium,
    /// 1080p @ 30fps, 4 Mbps - good connections.
    High,
}

impl Quality {
    /// Maximum video width in pixels for this quality tier.
    #[must_use]
    pub const fn max_width(&self) -> u32 {
        match self {
            Self::Low => 854,
            Self::Medium => 1280,
            Self::High => 1920,
        }
    }

    /// Maximum video height in pixels for this quality tier.
    #[must_use]
    pub const fn max_height(&self) -> u32 {
        match self {
            Self::Low => 480,
            Self::Medium => 720,
            Self::High => 1080,
        }
    }

    /// Maximum frames per second for this quality tier.
    #[must_use]
    pub const fn max_fps(&self) -> u32 {
        match self {
            Self::Low => 15,
            Self::Medium | Self::High => 30,
        }
    }

    /// Target bitrate in bits per second for this quality tier.
    ///
    /// This is the bitrate the encoder should aim for under normal conditions.
    #[must_use]
    pub const fn target_bitrate(&self) -> u32 {
        match self {
            Self::Low => 750_000,      // 750 kbps
            Self::Medium => 2_000_000, // 2 Mbps
            Self::High => 4_000_000,   // 4 Mbps
        }
    }

    /// Maximum bitrate in bits per second for this quality tier.
    ///
    /// This is the hard upper limit the encoder should never exceed.
    #[must_use]
    pub const fn max_bitrate(&self) -> u32 {
        match self {
            Self::Low => 1_000_000,    // 1 Mbps
            Self::Medium => 3_000_000, // 3 Mbps
            Self::High => 5_000_000,   // 5 Mbps
        }
    }

    /// Returns the next lower quality tier, or the same tier if already at lowest.
    #[must_use]
    pub const fn downgrade(&self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }

    /// Returns the next higher quality tier, up to the specified maximum.
    #[must_use]
    pub const fn upgrade(&self, max: Self) -> Self {
        let next = match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        };

        if next.ordinal() <= max.ordinal() {
            next
        } else {
            max
        }
    }

    const fn ordinal(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    /// Returns all quality tiers in ascending order.
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::Low, Self::Medium, Self::High]
    }
}
