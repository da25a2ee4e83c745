//! Client Transports
//!
//! Client half of a server transport: a full ICE agent and a DTLS client
//! talking to the server's ICE-lite endpoint. The connect handshake runs
//! lazily on first use and exactly once; produce and consume go through the
//! transport of the matching direction and attach an RTP sender or receiver
//! to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};
use vc_common::ortc::{IceRole, MediaReceiver, StackOptions, TransportStack};
use vc_common::protocol::{
    ClientRequest, ConnectTransport, Consume, ConsumerOptions, CreateTransport, Produce,
    ProduceResponse, TransportOptions,
};
use vc_common::{
    DtlsParameters, DtlsRole, IceServer, IceState, ProducerId, RoomId, RtpCapabilities,
    RtpParameters, TransportDirection, TransportId,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::util::vnet::net::Net;

use crate::error::SessionError;
use crate::media::LocalTrack;
use crate::signaling::{decode, SignalingChannel};

/// A published track: the server's producer and the local RTP sender.
pub struct Publication {
    pub producer_id: ProducerId,
    pub sender: Arc<RTCRtpSender>,
}

/// One send or receive transport.
pub struct ClientTransport {
    room_id: RoomId,
    id: TransportId,
    direction: TransportDirection,
    options: TransportOptions,
    stack: Arc<TransportStack>,
    signaling: Arc<dyn SignalingChannel>,
    connected: OnceCell<()>,
    ice_state: watch::Sender<IceState>,
    closed: AtomicBool,
}

fn media_error(e: &webrtc::Error) -> String {
    e.to_string()
}

impl ClientTransport {
    /// Ask the server for a transport in `direction` and start gathering.
    ///
    /// `network` replaces the host interfaces, for running against an
    /// in-process LAN.
    pub async fn create(
        signaling: Arc<dyn SignalingChannel>,
        room_id: RoomId,
        direction: TransportDirection,
        network: Option<Arc<Net>>,
    ) -> Result<Arc<Self>, SessionError> {
        let data = signaling
            .request(ClientRequest::CreateTransport(CreateTransport {
                room_id: room_id.clone(),
                direction,
            }))
            .await
            .map_err(|e| match e {
                SessionError::Signaling { .. } | SessionError::Protocol(_) => {
                    SessionError::TransportCreationFailure(e.to_string())
                }
                other => other,
            })?;
        let options: TransportOptions = decode(data)?;
        debug!(transport_id = %options.id, %direction, "Transport created");
        let transport = Self::from_options(signaling, room_id, options, network).await?;
        Ok(Arc::new(transport))
    }

    /// Build the local stack for a transport the server already created.
    pub async fn from_options(
        signaling: Arc<dyn SignalingChannel>,
        room_id: RoomId,
        options: TransportOptions,
        network: Option<Arc<Net>>,
    ) -> Result<Self, SessionError> {
        let stack = TransportStack::new(StackOptions {
            ice_servers: options.ice_servers.clone(),
            network,
            ..StackOptions::default()
        })
        .map_err(|e| SessionError::TransportCreationFailure(media_error(&e)))?;
        stack
            .gather()
            .await
            .map_err(|e| SessionError::TransportCreationFailure(media_error(&e)))?;

        let (ice_state, _) = watch::channel(IceState::New);
        Ok(Self {
            room_id,
            id: options.id,
            direction: options.direction,
            options,
            stack: Arc::new(stack),
            signaling,
            connected: OnceCell::new(),
            ice_state,
            closed: AtomicBool::new(false),
        })
    }

    pub const fn id(&self) -> TransportId {
        self.id
    }

    pub const fn direction(&self) -> TransportDirection {
        self.direction
    }

    /// STUN/TURN servers the server handed out with the transport.
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.options.ice_servers
    }

    /// The server's DTLS parameters.
    pub const fn remote_dtls_parameters(&self) -> &DtlsParameters {
        &self.options.dtls_parameters
    }

    pub fn is_connected(&self) -> bool {
        self.connected.initialized()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ice_state(&self) -> IceState {
        *self.ice_state.borrow()
    }

    pub fn subscribe_ice_state(&self) -> watch::Receiver<IceState> {
        self.ice_state.subscribe()
    }

    /// Called with every state the ICE agent reports.
    pub fn on_ice_state<F>(&self, callback: F)
    where
        F: Fn(IceState) + Send + Sync + 'static,
    {
        self.stack.on_ice_state(callback);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::IceFailure(format!(
                "{} transport {} is closed",
                self.direction, self.id
            )));
        }
        Ok(())
    }

    /// Run ICE and the DTLS handshake while `connect-transport` carries our
    /// parameters to the server. Concurrent callers share the attempt.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.connected
            .get_or_try_init(|| async {
                let ice_parameters = self
                    .stack
                    .ice_parameters()
                    .await
                    .map_err(|e| SessionError::TransportConnectFailure(media_error(&e)))?;
                let dtls_parameters = self
                    .stack
                    .dtls_parameters(DtlsRole::Client)
                    .map_err(|e| SessionError::TransportConnectFailure(media_error(&e)))?;
                // The server answers as DTLS server whatever it advertised.
                let server_dtls = DtlsParameters {
                    role: DtlsRole::Server,
                    ..self.options.dtls_parameters.clone()
                };

                let request = async {
                    self.signaling
                        .request(ClientRequest::ConnectTransport(ConnectTransport {
                            room_id: self.room_id.clone(),
                            transport_id: self.id,
                            ice_parameters,
                            dtls_parameters,
                        }))
                        .await
                        .map_err(|e| match e {
                            SessionError::Signaling { .. } => {
                                SessionError::TransportConnectFailure(e.to_string())
                            }
                            other => other,
                        })
                };
                let handshake = async {
                    self.stack
                        .start(
                            IceRole::Controlling,
                            &self.options.ice_parameters,
                            &self.options.ice_candidates,
                            &server_dtls,
                        )
                        .await
                        .map_err(|e| SessionError::TransportConnectFailure(media_error(&e)))
                };
                tokio::try_join!(request, handshake)?;

                info!(transport_id = %self.id, direction = %self.direction, "Transport connected");
                Ok::<(), SessionError>(())
            })
            .await
            .map(|_| ())
    }

    /// Publish a local track. Send transports only.
    ///
    /// The producer is created first so the server is listening for the
    /// stream before the first packet goes out.
    pub async fn produce(
        &self,
        track: &LocalTrack,
        rtp_parameters: RtpParameters,
    ) -> Result<Publication, SessionError> {
        if self.direction != TransportDirection::Send {
            return Err(SessionError::ProduceFailure(
                "produce requires a send transport".into(),
            ));
        }
        let codec = rtp_parameters
            .codec()
            .cloned()
            .ok_or_else(|| SessionError::ProduceFailure("no codec to send with".into()))?;
        self.connect().await?;

        let source = track.source();
        let data = self
            .signaling
            .request(ClientRequest::Produce(Produce {
                room_id: self.room_id.clone(),
                transport_id: self.id,
                kind: source.kind(),
                rtp_parameters,
                app_data: source.app_data(),
                source: Some(source),
                quality: track.quality(),
            }))
            .await?;
        let response: ProduceResponse = decode(data)?;

        let sender = self
            .stack
            .send(source.kind(), track.rtp_track(), &codec, track.ssrc())
            .await
            .map_err(|e| SessionError::ProduceFailure(media_error(&e)))?;
        Ok(Publication {
            producer_id: response.id,
            sender,
        })
    }

    /// Subscribe to a remote producer and start receiving it. Receive
    /// transports only.
    ///
    /// `rtp_capabilities` can only narrow the capabilities registered after
    /// join.
    pub async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> Result<(ConsumerOptions, MediaReceiver), SessionError> {
        if self.direction != TransportDirection::Recv {
            return Err(SessionError::ConsumeFailure(
                "consume requires a receive transport".into(),
            ));
        }
        self.connect().await?;

        let data = self
            .signaling
            .request(ClientRequest::Consume(Consume {
                room_id: self.room_id.clone(),
                producer_id,
                rtp_capabilities,
            }))
            .await?;
        let options: ConsumerOptions = decode(data)?;

        let codec = options
            .rtp_parameters
            .codec()
            .ok_or_else(|| SessionError::ConsumeFailure("consumer has no codec".into()))?;
        let ssrc = options
            .rtp_parameters
            .ssrc()
            .ok_or_else(|| SessionError::ConsumeFailure("consumer has no ssrc".into()))?;
        let receiver = self
            .stack
            .receive(options.kind, codec, ssrc)
            .await
            .map_err(|e| SessionError::ConsumeFailure(media_error(&e)))?;
        Ok((options, receiver))
    }

    /// Record an ICE state reported by the agent.
    ///
    /// Returns true when this call moved the transport into a fatal state,
    /// which closes it.
    pub fn handle_ice_state(&self, state: IceState) -> bool {
        self.ice_state.send_replace(state);
        if !state.is_fatal() {
            return false;
        }
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            warn!(transport_id = %self.id, direction = %self.direction, ?state, "Transport ICE failed");
            self.stop_stack();
        }
        first
    }

    /// Close locally and stop the media stack. Returns true on the first
    /// call.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.ice_state.send_replace(IceState::Closed);
            self.stop_stack();
        }
        first
    }

    fn stop_stack(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let stack = Arc::clone(&self.stack);
        let id = self.id;
        runtime.spawn(async move {
            if let Err(e) = stack.stop().await {
                debug!(transport_id = %id, error = %e, "Media stack did not stop cleanly");
            }
        });
    }
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
