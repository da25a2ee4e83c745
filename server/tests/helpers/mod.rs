//! Reusable test helpers for signaling integration tests.
//!
//! Provides `TestPeer` for driving the signaling service directly, media
//! parameter fixtures, and [`spawn_test_server()`] for end-to-end WebSocket
//! tests through the full axum router.
//!
//! Media runs over a virtual LAN: the server's workers and every client
//! transport get their own host on it, so ICE and DTLS complete without
//! touching real interfaces.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vc_common::ortc::{IceRole, StackOptions, TransportStack, VirtualLan};
use vc_common::protocol::{
    ClientRequest, ConnectTransport, Consume, ConsumerOptions, CreateTransport, JoinRoomResponse,
    Produce, ProduceResponse, RegisterCapabilities, RoomRef, ServerFrame, ServerNotification,
    TransportOptions,
};
use vc_common::{
    DtlsParameters, DtlsRole, MediaKind, PeerId, ProducerId, Quality, RoomId, RtcpParameters,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TrackSource, TransportDirection,
    TransportId,
};
use vc_sfu::api::{create_router, AppState};
use vc_sfu::config::Config;
use vc_sfu::engine::{Router, WorkerPool};
use vc_sfu::voice::{RouterRegistry, Session, SignalingService, VoiceError};

/// How long to wait for an expected notification.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Service construction
// ============================================================================

/// A signaling service and the LAN its media runs on.
pub struct TestService {
    pub service: Arc<SignalingService>,
    pub lan: Arc<VirtualLan>,
}

impl Deref for TestService {
    type Target = Arc<SignalingService>;

    fn deref(&self) -> &Self::Target {
        &self.service
    }
}

/// Worker pool whose transports listen on a host of `lan`.
async fn pool_on(config: &Config, lan: &VirtualLan) -> WorkerPool {
    let mut settings = config.worker_settings();
    settings.network = Some(lan.host().await.expect("server LAN host"));
    WorkerPool::new(config.media_workers, settings).expect("worker pool")
}

/// Signaling service over a fresh worker pool.
pub async fn service_with(config: Config) -> TestService {
    let lan = Arc::new(VirtualLan::new().await.expect("virtual LAN"));
    let pool = pool_on(&config, &lan).await;
    let service =
        SignalingService::new(Arc::new(config), Arc::new(RouterRegistry::new(Arc::new(pool))));
    TestService { service, lan }
}

pub async fn service() -> TestService {
    service_with(Config::default_for_test()).await
}

/// Spawn the full HTTP/WebSocket app on an ephemeral port.
pub async fn spawn_test_server(config: Config) -> (SocketAddr, AppState, JoinHandle<()>) {
    let lan = VirtualLan::new().await.expect("virtual LAN");
    let pool = pool_on(&config, &lan).await;
    let state = AppState::new(config, pool);
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("test server");
    });
    (addr, state, handle)
}

// ============================================================================
// Media fixtures
// ============================================================================

fn parameters(kind: MediaKind, payload_type: u8, ssrc: u32) -> RtpParameters {
    let caps = Router::media_codecs();
    let codec = caps.codec_for(kind).expect("router codec");
    RtpParameters {
        mid: Some(ssrc.to_string()),
        codecs: vec![RtpCodecParameters::from_capability(codec, payload_type)],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: Some("test".into()),
            reduced_size: true,
        },
    }
}

pub fn audio_parameters(ssrc: u32) -> RtpParameters {
    parameters(MediaKind::Audio, 100, ssrc)
}

pub fn video_parameters(ssrc: u32) -> RtpParameters {
    parameters(MediaKind::Video, 101, ssrc)
}

// ============================================================================
// Test peer
// ============================================================================

/// One signaling client driven through the service API, with a real
/// media stack per transport.
pub struct TestPeer {
    pub service: Arc<SignalingService>,
    pub lan: Arc<VirtualLan>,
    pub session: Arc<Session>,
    pub rx: mpsc::Receiver<ServerFrame>,
    pub room: Option<RoomId>,
    pub send_transport: Option<TransportId>,
    pub recv_transport: Option<TransportId>,
    pub send_stack: Option<TransportStack>,
    pub recv_stack: Option<TransportStack>,
}

impl TestPeer {
    /// Connect and consume the `ready` notification.
    pub async fn connect(service: &TestService, username: &str) -> Self {
        let (session, rx) = service.connect(username.into());
        let mut peer = Self {
            service: service.service.clone(),
            lan: service.lan.clone(),
            session,
            rx,
            room: None,
            send_transport: None,
            recv_transport: None,
            send_stack: None,
            recv_stack: None,
        };
        match peer.next_notification().await {
            ServerNotification::Ready { peer_id } => assert_eq!(peer_id, peer.peer_id()),
            other => panic!("expected ready, got {other:?}"),
        }
        peer
    }

    pub fn peer_id(&self) -> PeerId {
        self.session.peer_id()
    }

    pub fn room_id(&self) -> RoomId {
        self.room.clone().expect("peer has joined a room")
    }

    pub async fn request(&self, request: ClientRequest) -> Result<Value, VoiceError> {
        self.service.handle(&self.session, request).await
    }

    pub async fn join(&mut self, room: &str) -> JoinRoomResponse {
        self.try_join(room).await.expect("join-room")
    }

    pub async fn try_join(&mut self, room: &str) -> Result<JoinRoomResponse, VoiceError> {
        let data = self
            .request(ClientRequest::JoinRoom(RoomRef {
                room_id: RoomId::from(room),
            }))
            .await?;
        self.room = Some(RoomId::from(room));
        Ok(serde_json::from_value(data).expect("join-room response"))
    }

    pub async fn register_capabilities(&self) {
        self.request(ClientRequest::RegisterCapabilities(RegisterCapabilities {
            room_id: self.room_id(),
            rtp_capabilities: Router::media_codecs(),
        }))
        .await
        .expect("register-capabilities");
    }

    /// Create a transport without connecting it.
    pub async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportOptions, VoiceError> {
        let data = self
            .request(ClientRequest::CreateTransport(CreateTransport {
                room_id: self.room_id(),
                direction,
            }))
            .await?;
        Ok(serde_json::from_value(data).expect("transport options"))
    }

    /// Create a transport and complete ICE and DTLS against it.
    pub async fn open_transport(&mut self, direction: TransportDirection) -> TransportOptions {
        let options = self
            .create_transport(direction)
            .await
            .expect("create-transport");
        let stack = TransportStack::new(StackOptions {
            network: Some(self.lan.host().await.expect("client LAN host")),
            ..StackOptions::default()
        })
        .expect("client stack");
        stack.gather().await.expect("gather");
        let ice_parameters = stack.ice_parameters().await.expect("client ICE parameters");
        let dtls_parameters = stack
            .dtls_parameters(DtlsRole::Client)
            .expect("client DTLS parameters");
        let server_dtls = DtlsParameters {
            role: DtlsRole::Server,
            ..options.dtls_parameters.clone()
        };

        let (served, dialed) = tokio::join!(
            self.request(ClientRequest::ConnectTransport(ConnectTransport {
                room_id: self.room_id(),
                transport_id: options.id,
                ice_parameters,
                dtls_parameters,
            })),
            stack.start(
                IceRole::Controlling,
                &options.ice_parameters,
                &options.ice_candidates,
                &server_dtls,
            ),
        );
        served.expect("connect-transport");
        dialed.expect("client handshake");

        match direction {
            TransportDirection::Send => {
                self.send_transport = Some(options.id);
                self.send_stack = Some(stack);
            }
            TransportDirection::Recv => {
                self.recv_transport = Some(options.id);
                self.recv_stack = Some(stack);
            }
        }
        options
    }

    /// Join, register and open both transports.
    pub async fn join_ready(&mut self, room: &str) -> JoinRoomResponse {
        let response = self.join(room).await;
        self.register_capabilities().await;
        self.open_transport(TransportDirection::Send).await;
        self.open_transport(TransportDirection::Recv).await;
        response
    }

    pub async fn produce(
        &self,
        source: TrackSource,
        rtp_parameters: RtpParameters,
        quality: Option<Quality>,
    ) -> Result<ProducerId, VoiceError> {
        let data = self
            .request(ClientRequest::Produce(Produce {
                room_id: self.room_id(),
                transport_id: self.send_transport.expect("send transport"),
                kind: source.kind(),
                rtp_parameters,
                app_data: source.app_data(),
                source: None,
                quality,
            }))
            .await?;
        let response: ProduceResponse = serde_json::from_value(data).expect("produce response");
        Ok(response.id)
    }

    pub async fn produce_audio(&self) -> ProducerId {
        self.produce(TrackSource::Microphone, audio_parameters(1111), None)
            .await
            .expect("produce audio")
    }

    pub async fn consume(&self, producer_id: ProducerId) -> Result<ConsumerOptions, VoiceError> {
        self.consume_with(producer_id, None).await
    }

    /// Consume, sending capabilities inline with the request.
    pub async fn consume_with(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Option<vc_common::RtpCapabilities>,
    ) -> Result<ConsumerOptions, VoiceError> {
        let data = self
            .request(ClientRequest::Consume(Consume {
                room_id: self.room_id(),
                producer_id,
                rtp_capabilities,
            }))
            .await?;
        Ok(serde_json::from_value(data).expect("consumer options"))
    }

    /// Next notification, skipping acks. Panics after [`RECV_TIMEOUT`].
    pub async fn next_notification(&mut self) -> ServerNotification {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
                .await
                .expect("notification before timeout")
                .expect("session channel open");
            if let ServerFrame::Notification(notification) = frame {
                return notification;
            }
        }
    }

    /// Next acknowledgment, skipping notifications.
    pub async fn next_ack(&mut self) -> vc_common::protocol::Ack {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
                .await
                .expect("ack before timeout")
                .expect("session channel open");
            if let ServerFrame::Ack(ack) = frame {
                return ack;
            }
        }
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<ServerNotification> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            if let ServerFrame::Notification(notification) = frame {
                out.push(notification);
            }
        }
        out
    }
}
