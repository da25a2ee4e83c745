//! Shared Types

mod call;
mod ids;
mod media;
mod peer;
mod rtp;
mod transport;

pub use call::CallEndReason;
pub use ids::{CallId, ConsumerId, PeerId, ProducerId, RoomId, RouterId, TransportId};
pub use media::{AppData, MediaKind, Quality, TrackSource};
pub use peer::{MediaState, PeerInfo, ProducerInfo};
pub use rtp::{
    RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters,
};
pub use transport::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceCandidateInit, IceCandidateType,
    IceParameters, IceProtocol, IceServer, IceState, TransportDirection, TransportState,
};
