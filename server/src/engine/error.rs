//! Media Engine Errors

use thiserror::Error;
use vc_common::{ConsumerId, ProducerId, RouterId, TransportDirection, TransportId, TransportState};

/// Errors raised by workers, routers and the objects they own.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Worker pool configured with zero workers.
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    /// Port range empty or too small for the worker count.
    #[error("Invalid RTC port range {min}-{max} for {workers} workers")]
    InvalidPortRange {
        /// Lowest port.
        min: u16,
        /// Highest port.
        max: u16,
        /// Number of workers sharing the range.
        workers: usize,
    },

    /// Worker has died or was shut down.
    #[error("Worker {0} is closed")]
    WorkerClosed(usize),

    /// Every port of the worker's range is leased.
    #[error("Worker {0} has no free RTC ports")]
    PortsExhausted(usize),

    /// Router has been closed.
    #[error("Router {0} is closed")]
    RouterClosed(RouterId),

    /// Transport not found.
    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    /// Producer not found.
    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Consumer not found.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Transport is in the wrong state for the operation.
    #[error("Transport {id} is {state:?}")]
    InvalidTransportState {
        /// Transport ID.
        id: TransportId,
        /// Current state.
        state: TransportState,
    },

    /// Operation needs the other transport direction.
    #[error("Transport {id} is not a {expected} transport")]
    WrongDirection {
        /// Transport ID.
        id: TransportId,
        /// Direction the operation needs.
        expected: TransportDirection,
    },

    /// Remote DTLS parameters rejected.
    #[error("Invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    /// Remote ICE parameters rejected.
    #[error("Invalid ICE parameters: {0}")]
    InvalidIceParameters(String),

    /// ICE checks or the DTLS handshake failed.
    #[error("Handshake failed on transport {id}: {reason}")]
    HandshakeFailed {
        /// Transport ID.
        id: TransportId,
        /// Failure reported by the media stack.
        reason: String,
    },

    /// ICE or DTLS did not complete in time.
    #[error("Handshake timed out on transport {0}")]
    HandshakeTimeout(TransportId),

    /// No usable local ICE candidate could be gathered.
    #[error("No ICE candidates gathered on worker {0}")]
    NoCandidates(usize),

    /// Media stack failure outside a handshake.
    #[error("Media stack error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// Codec not in the router's capabilities or not matching the kind.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Malformed RTP parameters.
    #[error("Invalid RTP parameters: {0}")]
    InvalidRtpParameters(String),

    /// Capabilities cannot receive the producer's codec.
    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    CannotConsume(ProducerId),

    /// RTP packet could not be parsed.
    #[error("RTP error: {0}")]
    Rtp(String),
}

impl From<webrtc::util::Error> for EngineError {
    fn from(err: webrtc::util::Error) -> Self {
        Self::Rtp(err.to_string())
    }
}
