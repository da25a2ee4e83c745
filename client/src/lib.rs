//! `VoiceChat` Session Client
//!
//! Client side of the voice service: the SFU room [`SessionController`], its
//! transports and capability negotiation, and the [`MeshCall`] path for
//! direct 1:1 calls. Both speak the same signaling connection.

pub mod device;
pub mod error;
pub mod media;
pub mod mesh;
pub mod session;
pub mod signaling;
pub mod transport;

use async_trait::async_trait;

pub use device::Device;
pub use error::SessionError;
pub use media::{CaptureError, LocalTrack, MediaDevices, PlaybackSink, RemoteTrack, Surface};
pub use mesh::{MeshCall, MeshEvent};
pub use session::{SessionController, SessionEvent};
pub use signaling::{SignalingChannel, WsSignaling, DEFAULT_ACK_TIMEOUT};
pub use transport::{ClientTransport, Publication};

/// How media flows in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Every peer sends to and receives from the router.
    Sfu,
    /// A direct peer connection per participant pair.
    Mesh,
}

/// Common surface of SFU sessions and mesh calls.
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn topology(&self) -> Topology;

    /// Stop local capture, close connections and tell the server.
    async fn leave(&self) -> Result<(), SessionError>;
}
