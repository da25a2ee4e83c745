//! ORTC media stack shared by the SFU and the client.
//!
//! A [`TransportStack`] is one ICE gatherer, ICE transport and DTLS transport
//! built with webrtc-rs's object API. RTP senders and receivers are attached
//! once the DTLS handshake is done. Each gets its own media engine holding
//! only the codec agreed over signaling, so the payload type on the wire is
//! the one both sides already know.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{oneshot, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::dtls_transport::dtls_fingerprint::RTCDtlsFingerprint;
use webrtc::dtls_transport::dtls_parameters::DTLSParameters;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::dtls_transport::RTCDtlsTransport;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gatherer::{RTCIceGatherOptions, RTCIceGatherer};
use webrtc::ice_transport::ice_parameters::RTCIceParameters;
use webrtc::ice_transport::ice_protocol::RTCIceProtocol;
use webrtc::ice_transport::ice_role::RTCIceRole;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::ice_transport::ice_transport_state::RTCIceTransportState;
use webrtc::ice_transport::RTCIceTransport;
use webrtc::interceptor::registry::Registry;
use webrtc::interceptor::Interceptor;
use webrtc::peer_connection::certificate::RTCCertificate;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::{
    RTCPFeedback, RTCRtpCodingParameters, RTCRtpReceiveParameters, RTCRtpSendParameters,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Nic, Router, RouterConfig};
use webrtc::Error;

use crate::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceCandidateType, IceParameters,
    IceProtocol, IceServer, IceState, MediaKind, RtpCodecParameters,
};

/// Result alias for media stack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifetime of generated DTLS certificates.
const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Subject of generated DTLS certificates.
const CERTIFICATE_NAME: &str = "vc-media";

/// Generate a self-signed ECDSA certificate for DTLS.
pub fn generate_certificate() -> Result<RTCCertificate> {
    let certificate =
        webrtc::dtls::crypto::Certificate::generate_self_signed(vec![CERTIFICATE_NAME.to_owned()])?;
    Ok(RTCCertificate::from_existing(
        certificate,
        SystemTime::now() + CERTIFICATE_LIFETIME,
    ))
}

/// `sha-256` fingerprints of a certificate.
#[must_use]
pub fn certificate_fingerprints(certificate: &RTCCertificate) -> Vec<DtlsFingerprint> {
    certificate
        .get_fingerprints()
        .into_iter()
        .map(|f| DtlsFingerprint {
            algorithm: f.algorithm,
            value: f.value,
        })
        .collect()
}

/// ICE role taken in the connectivity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    /// Sends checks and nominates the pair (full agent).
    Controlling,
    /// Answers checks (the lite SFU side).
    Controlled,
}

/// Options for building a [`TransportStack`].
#[derive(Clone, Default)]
pub struct StackOptions {
    /// Answer connectivity checks only, host candidates only.
    pub ice_lite: bool,
    /// Bind exactly this UDP port. `0` lets the OS pick.
    pub port: u16,
    /// Restrict gathering to one local address.
    pub listen_ip: Option<IpAddr>,
    /// STUN/TURN servers used while gathering.
    pub ice_servers: Vec<IceServer>,
    /// Fixed local ICE credentials.
    pub ice_credentials: Option<IceParameters>,
    /// Certificate presented in the handshake. Generated when absent.
    pub certificate: Option<RTCCertificate>,
    /// In-process network used instead of the host interfaces.
    pub network: Option<Arc<Net>>,
}

impl std::fmt::Debug for StackOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackOptions")
            .field("ice_lite", &self.ice_lite)
            .field("port", &self.port)
            .field("listen_ip", &self.listen_ip)
            .field("ice_servers", &self.ice_servers.len())
            .field("virtual_network", &self.network.is_some())
            .finish_non_exhaustive()
    }
}

/// One ICE + DTLS transport.
pub struct TransportStack {
    gatherer: Arc<RTCIceGatherer>,
    ice: Arc<RTCIceTransport>,
    dtls: Arc<RTCDtlsTransport>,
    ice_lite: bool,
}

impl TransportStack {
    /// Build the gatherer, ICE and DTLS transports. Nothing is bound until
    /// [`Self::gather`].
    pub fn new(options: StackOptions) -> Result<Self> {
        let mut settings = SettingEngine::default();
        settings.set_lite(options.ice_lite);
        settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        if options.port != 0 {
            settings.set_udp_network(UDPNetwork::Ephemeral(EphemeralUDP::new(
                options.port,
                options.port,
            )?));
        }
        if let Some(listen_ip) = options.listen_ip.filter(|ip| !ip.is_unspecified()) {
            settings.set_ip_filter(Box::new(move |ip: IpAddr| ip == listen_ip));
        }
        if let Some(credentials) = &options.ice_credentials {
            settings.set_ice_credentials(
                credentials.username_fragment.clone(),
                credentials.password.clone(),
            );
        }
        if options.network.is_some() {
            settings.set_vnet(options.network);
        }

        let api = APIBuilder::new().with_setting_engine(settings).build();
        let gatherer = Arc::new(api.new_ice_gatherer(RTCIceGatherOptions {
            ice_servers: options.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        })?);
        let ice = Arc::new(api.new_ice_transport(Arc::clone(&gatherer)));
        let certificates = options.certificate.into_iter().collect();
        let dtls = Arc::new(api.new_dtls_transport(Arc::clone(&ice), certificates)?);

        Ok(Self {
            gatherer,
            ice,
            dtls,
            ice_lite: options.ice_lite,
        })
    }

    /// Start gathering without waiting for it to finish.
    pub async fn gather(&self) -> Result<()> {
        self.gatherer.gather().await
    }

    /// Gather and wait until every local candidate is known.
    pub async fn gather_complete(&self) -> Result<Vec<IceCandidate>> {
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);
        self.gatherer.on_gathering_complete(Box::new(move || {
            if let Some(tx) = done_tx.take() {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));
        self.gatherer.gather().await?;
        let _ = done_rx.await;
        self.local_candidates().await
    }

    /// Local candidates gathered so far, without peer-reflexive ones.
    pub async fn local_candidates(&self) -> Result<Vec<IceCandidate>> {
        Ok(self
            .gatherer
            .get_local_candidates()
            .await?
            .iter()
            .filter_map(ice_candidate)
            .collect())
    }

    /// Local ICE credentials.
    pub async fn ice_parameters(&self) -> Result<IceParameters> {
        let local = self.gatherer.get_local_parameters().await?;
        Ok(IceParameters {
            username_fragment: local.username_fragment,
            password: local.password,
            ice_lite: self.ice_lite,
        })
    }

    /// Local DTLS fingerprints, advertised with `role`.
    pub fn dtls_parameters(&self, role: DtlsRole) -> Result<DtlsParameters> {
        let local = self.dtls.get_local_parameters()?;
        Ok(DtlsParameters {
            role,
            fingerprints: local
                .fingerprints
                .into_iter()
                .map(|f| DtlsFingerprint {
                    algorithm: f.algorithm,
                    value: f.value,
                })
                .collect(),
        })
    }

    /// Report ICE state changes. The callback runs on the agent's task and
    /// must not block.
    pub fn on_ice_state<F>(&self, callback: F)
    where
        F: Fn(IceState) + Send + Sync + 'static,
    {
        self.ice
            .on_connection_state_change(Box::new(move |state: RTCIceTransportState| {
                if let Some(state) = ice_state(state) {
                    callback(state);
                }
                Box::pin(async {})
            }));
    }

    /// Run the ICE checks, then the DTLS handshake. Returns once SRTP keys
    /// are derived.
    pub async fn start(
        &self,
        role: IceRole,
        remote_ice: &IceParameters,
        remote_candidates: &[IceCandidate],
        remote_dtls: &DtlsParameters,
    ) -> Result<()> {
        if !remote_candidates.is_empty() {
            let candidates: Vec<RTCIceCandidate> =
                remote_candidates.iter().map(rtc_ice_candidate).collect();
            self.ice.set_remote_candidates(&candidates).await?;
        }
        let ice_role = match role {
            IceRole::Controlling => RTCIceRole::Controlling,
            IceRole::Controlled => RTCIceRole::Controlled,
        };
        self.ice
            .start(
                &RTCIceParameters {
                    username_fragment: remote_ice.username_fragment.clone(),
                    password: remote_ice.password.clone(),
                    ice_lite: remote_ice.ice_lite,
                },
                Some(ice_role),
            )
            .await?;
        self.dtls.start(rtc_dtls_parameters(remote_dtls)).await
    }

    /// Receive one RTP stream identified by `ssrc`.
    pub async fn receive(
        &self,
        kind: MediaKind,
        codec: &RtpCodecParameters,
        ssrc: u32,
    ) -> Result<MediaReceiver> {
        let (api, interceptor) = media_api(kind, codec)?;
        let receiver = Arc::new(api.new_rtp_receiver(
            codec_type(kind),
            Arc::clone(&self.dtls),
            interceptor,
        ));
        receiver
            .receive(&RTCRtpReceiveParameters {
                encodings: vec![RTCRtpCodingParameters {
                    ssrc,
                    payload_type: codec.payload_type,
                    ..Default::default()
                }],
            })
            .await?;

        let track = receiver
            .tracks()
            .await
            .into_iter()
            .next()
            .ok_or_else(|| Error::new(format!("no track for ssrc {ssrc}")))?;
        // Nothing was negotiated through SDP, so pin the agreed codec.
        track.set_payload_type(codec.payload_type);
        track.set_codec(rtc_codec_parameters(codec));

        Ok(MediaReceiver { receiver, track })
    }

    /// Send `track` as one RTP stream with the given `ssrc`.
    pub async fn send(
        &self,
        kind: MediaKind,
        track: Arc<TrackLocalStaticRTP>,
        codec: &RtpCodecParameters,
        ssrc: u32,
    ) -> Result<Arc<RTCRtpSender>> {
        let (api, interceptor) = media_api(kind, codec)?;
        let track: Arc<dyn TrackLocal + Send + Sync> = track;
        let sender = Arc::new(
            api.new_rtp_sender(Some(track), Arc::clone(&self.dtls), interceptor)
                .await,
        );
        sender
            .send(&RTCRtpSendParameters {
                rtp_parameters: RTCRtpParameters {
                    header_extensions: Vec::new(),
                    codecs: vec![rtc_codec_parameters(codec)],
                },
                encodings: vec![RTCRtpCodingParameters {
                    ssrc,
                    payload_type: codec.payload_type,
                    ..Default::default()
                }],
            })
            .await?;

        // Interceptors only see RTCP that somebody reads.
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move { while rtcp.read_rtcp().await.is_ok() {} });

        Ok(sender)
    }

    /// Tear down DTLS, ICE and the gatherer.
    pub async fn stop(&self) -> Result<()> {
        let dtls = self.dtls.stop().await;
        let ice = self.ice.stop().await;
        dtls.and(ice)
    }
}

/// An RTP receiver and its single remote track.
pub struct MediaReceiver {
    receiver: Arc<RTCRtpReceiver>,
    track: Arc<TrackRemote>,
}

impl std::fmt::Debug for MediaReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaReceiver")
            .field("ssrc", &self.track.ssrc())
            .field("payload_type", &self.track.payload_type())
            .finish_non_exhaustive()
    }
}

impl MediaReceiver {
    /// The remote track packets are read from.
    #[must_use]
    pub fn track(&self) -> Arc<TrackRemote> {
        Arc::clone(&self.track)
    }

    /// Stop receiving. Pending reads on the track return an error.
    pub async fn stop(&self) -> Result<()> {
        self.receiver.stop().await
    }
}

/// In-process LAN for running media stacks without touching host interfaces.
///
/// ICE never gathers loopback addresses, so two stacks on one machine need
/// either a real interface or this.
pub struct VirtualLan {
    router: Arc<Mutex<Router>>,
    next_host: AtomicU8,
}

impl VirtualLan {
    /// Subnet every host is placed on.
    pub const SUBNET: &'static str = "10.77.0.0/24";

    /// Create and start the LAN router.
    pub async fn new() -> Result<Self> {
        let router = Arc::new(Mutex::new(Router::new(RouterConfig {
            cidr: Self::SUBNET.to_owned(),
            ..Default::default()
        })?));
        router.lock().await.start().await?;
        Ok(Self {
            router,
            next_host: AtomicU8::new(2),
        })
    }

    /// Attach a new host with the next free address.
    pub async fn host(&self) -> Result<Arc<Net>> {
        let octet = self.next_host.fetch_add(1, Ordering::Relaxed);
        let net = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![format!("10.77.0.{octet}")],
            ..Default::default()
        })));
        let nic = net.get_nic()?;
        self.router.lock().await.add_net(Arc::clone(&nic)).await?;
        nic.lock().await.set_router(Arc::clone(&self.router)).await?;
        Ok(net)
    }
}

/// Per-stream media engine holding only the agreed codec.
fn media_api(
    kind: MediaKind,
    codec: &RtpCodecParameters,
) -> Result<(API, Arc<dyn Interceptor + Send + Sync>)> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(rtc_codec_parameters(codec), codec_type(kind))?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let interceptor = registry.build("")?;
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    Ok((api, interceptor))
}

/// webrtc-rs codec type for a media kind.
#[must_use]
pub const fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

/// Codec capability as webrtc-rs tracks describe it.
#[must_use]
pub fn rtc_codec_capability(codec: &RtpCodecParameters) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type.clone(),
        clock_rate: codec.clock_rate,
        channels: codec.channels.unwrap_or(0),
        sdp_fmtp_line: codec.fmtp_line(),
        rtcp_feedback: codec
            .rtcp_feedback
            .iter()
            .map(|fb| RTCPFeedback {
                typ: fb.kind.clone(),
                parameter: fb.parameter.clone(),
            })
            .collect(),
    }
}

fn rtc_codec_parameters(codec: &RtpCodecParameters) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: rtc_codec_capability(codec),
        payload_type: codec.payload_type,
        ..Default::default()
    }
}

/// STUN/TURN entry as the ICE agent takes it.
#[must_use]
pub fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Map an ICE transport state. `Unspecified` has no counterpart.
#[must_use]
pub const fn ice_state(state: RTCIceTransportState) -> Option<IceState> {
    Some(match state {
        RTCIceTransportState::New => IceState::New,
        RTCIceTransportState::Checking => IceState::Checking,
        RTCIceTransportState::Connected => IceState::Connected,
        RTCIceTransportState::Completed => IceState::Completed,
        RTCIceTransportState::Disconnected => IceState::Disconnected,
        RTCIceTransportState::Failed => IceState::Failed,
        RTCIceTransportState::Closed => IceState::Closed,
        RTCIceTransportState::Unspecified => return None,
    })
}

fn ice_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    let candidate_type = match candidate.typ {
        RTCIceCandidateType::Host => IceCandidateType::Host,
        RTCIceCandidateType::Srflx => IceCandidateType::Srflx,
        RTCIceCandidateType::Relay => IceCandidateType::Relay,
        _ => return None,
    };
    let protocol = match candidate.protocol {
        RTCIceProtocol::Udp => IceProtocol::Udp,
        RTCIceProtocol::Tcp => IceProtocol::Tcp,
        RTCIceProtocol::Unspecified => return None,
    };
    Some(IceCandidate {
        foundation: candidate.foundation.clone(),
        priority: candidate.priority,
        ip: candidate.address.clone(),
        port: candidate.port,
        protocol,
        candidate_type,
        tcp_type: (!candidate.tcp_type.is_empty()).then(|| candidate.tcp_type.clone()),
    })
}

fn rtc_ice_candidate(candidate: &IceCandidate) -> RTCIceCandidate {
    RTCIceCandidate {
        foundation: candidate.foundation.clone(),
        priority: candidate.priority,
        address: candidate.ip.clone(),
        protocol: match candidate.protocol {
            IceProtocol::Udp => RTCIceProtocol::Udp,
            IceProtocol::Tcp => RTCIceProtocol::Tcp,
        },
        port: candidate.port,
        typ: match candidate.candidate_type {
            IceCandidateType::Host => RTCIceCandidateType::Host,
            IceCandidateType::Srflx => RTCIceCandidateType::Srflx,
            IceCandidateType::Relay => RTCIceCandidateType::Relay,
        },
        component: 1,
        tcp_type: candidate.tcp_type.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn rtc_dtls_parameters(parameters: &DtlsParameters) -> DTLSParameters {
    DTLSParameters {
        role: match parameters.role {
            DtlsRole::Auto => DTLSRole::Auto,
            DtlsRole::Client => DTLSRole::Client,
            DtlsRole::Server => DTLSRole::Server,
        },
        fingerprints: parameters
            .fingerprints
            .iter()
            .map(|f| RTCDtlsFingerprint {
                algorithm: f.algorithm.to_ascii_lowercase(),
                value: f.value.to_ascii_lowercase(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus() -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: "audio/opus".into(),
            payload_type: 100,
            clock_rate: 48000,
            channels: Some(2),
            parameters: [("useinbandfec".to_owned(), serde_json::json!(1))]
                .into_iter()
                .collect(),
            rtcp_feedback: Vec::new(),
        }
    }

    #[test]
    fn test_codec_capability_carries_fmtp() {
        let capability = rtc_codec_capability(&opus());
        assert_eq!(capability.mime_type, "audio/opus");
        assert_eq!(capability.channels, 2);
        assert_eq!(capability.sdp_fmtp_line, "useinbandfec=1");
    }

    #[test]
    fn test_certificate_fingerprint_is_sha256() {
        let certificate = generate_certificate().unwrap();
        let fingerprints = certificate_fingerprints(&certificate);
        assert_eq!(fingerprints.len(), 1);
        assert_eq!(fingerprints[0].algorithm, "sha-256");
        assert!(fingerprints[0].is_well_formed());
    }

    #[test]
    fn test_remote_fingerprints_are_lowercased() {
        let parameters = rtc_dtls_parameters(&DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "SHA-256".into(),
                value: "AB:CD".into(),
            }],
        });
        assert_eq!(parameters.role, DTLSRole::Client);
        assert_eq!(parameters.fingerprints[0].algorithm, "sha-256");
        assert_eq!(parameters.fingerprints[0].value, "ab:cd");
    }

    #[test]
    fn test_unspecified_ice_state_is_dropped() {
        assert_eq!(ice_state(RTCIceTransportState::Unspecified), None);
        assert_eq!(
            ice_state(RTCIceTransportState::Failed),
            Some(IceState::Failed)
        );
    }

    #[tokio::test]
    async fn test_lite_stack_gathers_on_requested_port() {
        let lan = VirtualLan::new().await.unwrap();
        let stack = TransportStack::new(StackOptions {
            ice_lite: true,
            port: 40_123,
            network: Some(lan.host().await.unwrap()),
            ..Default::default()
        })
        .unwrap();

        let candidates = stack.gather_complete().await.unwrap();
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.port == 40_123));
        assert!(candidates
            .iter()
            .all(|c| c.candidate_type == IceCandidateType::Host));
        assert!(stack.ice_parameters().await.unwrap().ice_lite);
        stack.stop().await.ok();
    }

    #[tokio::test]
    async fn test_two_stacks_complete_handshake() {
        let lan = VirtualLan::new().await.unwrap();
        let server = TransportStack::new(StackOptions {
            ice_lite: true,
            port: 40_200,
            network: Some(lan.host().await.unwrap()),
            ..Default::default()
        })
        .unwrap();
        let client = TransportStack::new(StackOptions {
            network: Some(lan.host().await.unwrap()),
            ..Default::default()
        })
        .unwrap();

        let server_candidates = server.gather_complete().await.unwrap();
        let server_ice = server.ice_parameters().await.unwrap();
        let server_dtls = server.dtls_parameters(DtlsRole::Server).unwrap();
        client.gather().await.unwrap();
        let client_ice = client.ice_parameters().await.unwrap();
        let client_dtls = client.dtls_parameters(DtlsRole::Client).unwrap();

        let (served, dialed) = tokio::join!(
            server.start(IceRole::Controlled, &client_ice, &[], &client_dtls),
            client.start(
                IceRole::Controlling,
                &server_ice,
                &server_candidates,
                &server_dtls
            ),
        );
        served.unwrap();
        dialed.unwrap();

        client.stop().await.ok();
        server.stop().await.ok();
    }
}
