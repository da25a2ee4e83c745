//! WebRTC Transports
//!
//! One transport per peer, room and direction, each backed by an ICE-lite
//! agent bound to a leased port and a DTLS transport using the worker's
//! certificate. The state is published on a watch channel so consumers can
//! gate forwarding on `Connected` without taking a lock.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};
use vc_common::ortc::{IceRole, MediaReceiver, StackOptions, TransportStack};
use vc_common::{
    DtlsParameters, IceCandidate, IceParameters, IceState, MediaKind, PeerId, RtpCodecParameters,
    TransportDirection, TransportId, TransportState,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::dtls;
use super::error::EngineError;
use super::worker::Worker;

/// Server side of a client transport.
pub struct WebRtcTransport {
    id: TransportId,
    peer_id: PeerId,
    direction: TransportDirection,
    port: u16,
    worker: Arc<Worker>,
    stack: Arc<TransportStack>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    state: watch::Sender<TransportState>,
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WebRtcTransport {
    /// Lease a port and gather host candidates on it.
    pub(crate) async fn new(
        worker: Arc<Worker>,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<Self, EngineError> {
        let port = worker.lease_port()?;
        match Self::gather(&worker, port).await {
            Ok((stack, ice_parameters, ice_candidates)) => {
                let (state, _) = watch::channel(TransportState::New);
                Ok(Self {
                    id: TransportId::new(),
                    peer_id,
                    direction,
                    port,
                    worker,
                    stack: Arc::new(stack),
                    ice_parameters,
                    ice_candidates,
                    remote_dtls: Mutex::new(None),
                    state,
                })
            }
            Err(e) => {
                worker.release_port(port);
                Err(e)
            }
        }
    }

    async fn gather(
        worker: &Worker,
        port: u16,
    ) -> Result<(TransportStack, IceParameters, Vec<IceCandidate>), EngineError> {
        let settings = worker.settings();
        let stack = TransportStack::new(StackOptions {
            ice_lite: true,
            port,
            listen_ip: Some(settings.listen_ip),
            ice_credentials: Some(dtls::ice_parameters()),
            certificate: Some(worker.dtls().certificate().clone()),
            network: settings.network.clone(),
            ..StackOptions::default()
        })?;

        let gathered = match stack.gather_complete().await {
            Ok(candidates) => candidates,
            Err(e) => {
                let _ = stack.stop().await;
                return Err(e.into());
            }
        };
        if gathered.is_empty() {
            let _ = stack.stop().await;
            return Err(EngineError::NoCandidates(worker.id()));
        }
        let ice_candidates = gathered
            .into_iter()
            .map(|candidate| settings.advertise(candidate))
            .collect();
        let ice_parameters = stack.ice_parameters().await?;
        Ok((stack, ice_parameters, ice_candidates))
    }

    pub const fn id(&self) -> TransportId {
        self.id
    }

    /// Peer owning the transport.
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub const fn direction(&self) -> TransportDirection {
        self.direction
    }

    /// UDP port the ICE agent is bound to.
    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    pub fn ice_candidates(&self) -> &[IceCandidate] {
        &self.ice_candidates
    }

    /// Local DTLS parameters (the worker's certificate).
    pub fn dtls_parameters(&self) -> DtlsParameters {
        self.worker.dtls().parameters()
    }

    /// DTLS parameters supplied by the client on connect.
    pub fn remote_dtls_parameters(&self) -> Option<DtlsParameters> {
        self.remote_dtls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch the transport state.
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    /// Forward ICE agent state changes.
    pub(crate) fn on_ice_state<F>(&self, callback: F)
    where
        F: Fn(IceState) + Send + Sync + 'static,
    {
        self.stack.on_ice_state(callback);
    }

    /// Answer the client's connectivity checks and run the DTLS handshake.
    /// Resolves once media can flow.
    pub(crate) async fn connect(
        &self,
        remote_ice: IceParameters,
        remote_dtls: DtlsParameters,
    ) -> Result<(), EngineError> {
        let state = self.state();
        if state != TransportState::New {
            return Err(EngineError::InvalidTransportState { id: self.id, state });
        }
        dtls::validate_remote(&remote_dtls).map_err(EngineError::InvalidDtlsParameters)?;
        dtls::validate_remote_ice(&remote_ice).map_err(EngineError::InvalidIceParameters)?;

        *self
            .remote_dtls
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(remote_dtls.clone());
        self.state.send_replace(TransportState::Connecting);
        debug!(transport_id = %self.id, port = self.port, "ICE and DTLS handshake started");

        let timeout = self.worker.settings().handshake_timeout;
        let handshake = self
            .stack
            .start(IceRole::Controlled, &remote_ice, &[], &remote_dtls);
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(EngineError::HandshakeFailed {
                    id: self.id,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(EngineError::HandshakeTimeout(self.id)),
        }

        // Closed while the handshake ran.
        let connected = self.state.send_if_modified(|state| {
            if *state == TransportState::Connecting {
                *state = TransportState::Connected;
                true
            } else {
                false
            }
        });
        if !connected {
            return Err(EngineError::InvalidTransportState {
                id: self.id,
                state: self.state(),
            });
        }
        debug!(transport_id = %self.id, peer_id = %self.peer_id, "Transport connected");
        Ok(())
    }

    /// Start receiving the client's RTP stream `ssrc`.
    pub(crate) async fn receive(
        &self,
        kind: MediaKind,
        codec: &RtpCodecParameters,
        ssrc: u32,
    ) -> Result<MediaReceiver, EngineError> {
        Ok(self.stack.receive(kind, codec, ssrc).await?)
    }

    /// Start sending `track` to the client as RTP stream `ssrc`.
    pub(crate) async fn send(
        &self,
        kind: MediaKind,
        track: Arc<TrackLocalStaticRTP>,
        codec: &RtpCodecParameters,
        ssrc: u32,
    ) -> Result<Arc<RTCRtpSender>, EngineError> {
        Ok(self.stack.send(kind, track, codec, ssrc).await?)
    }

    /// Close the transport, stop the media stack and release its port.
    /// Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let previous = self.state.send_replace(TransportState::Closed);
        if previous == TransportState::Closed {
            return false;
        }
        self.stop_stack();
        self.worker.release_port(self.port);
        true
    }

    fn stop_stack(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let stack = Arc::clone(&self.stack);
        let id = self.id;
        runtime.spawn(async move {
            if let Err(e) = stack.stop().await {
                warn!(transport_id = %id, error = %e, "Media stack did not stop cleanly");
            }
        });
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.stop_stack();
            self.worker.release_port(self.port);
        }
    }
}
