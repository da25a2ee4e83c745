//! Signaling Protocol
//!
//! Event-named JSON messages exchanged over the signaling WebSocket.
//!
//! Client frames look like `{"id": 7, "event": "join-room", "data": {...}}`.
//! A frame carrying an `id` is answered by exactly one acknowledgment
//! `{"ack": 7, "ok": true, "data": {...}}` or
//! `{"ack": 7, "ok": false, "error": {"code": "...", "message": "..."}}`.
//! Server notifications look like `{"event": "new-producer", "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{
    AppData, CallEndReason, CallId, ConsumerId, DtlsParameters, IceCandidate, IceCandidateInit,
    IceParameters, IceServer, MediaKind, MediaState, PeerId, PeerInfo, ProducerId, ProducerInfo,
    Quality, RoomId, RtpCapabilities, RtpParameters, TrackSource, TransportDirection, TransportId,
};

// ============================================================================
// Client -> Server
// ============================================================================

/// Requests a client can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    JoinRoom(RoomRef),
    RegisterCapabilities(RegisterCapabilities),
    CreateTransport(CreateTransport),
    ConnectTransport(ConnectTransport),
    Produce(Produce),
    Consume(Consume),
    ResumeConsumer(ConsumerRef),
    PauseConsumer(ConsumerRef),
    PauseProducer(ProducerRef),
    ResumeProducer(ProducerRef),
    StopScreenShare(ProducerRef),
    StopVideo(ProducerRef),
    CloseProducer(ProducerRef),
    SetScreenShareQuality(SetScreenShareQuality),
    SetMediaState(SetMediaState),
    LeaveRoom(RoomRef),
    Ping(Empty),
    #[serde(rename = "call:start")]
    CallStart(CallStart),
    #[serde(rename = "call:join")]
    CallJoin(CallRef),
    #[serde(rename = "call:decline")]
    CallDecline(CallRef),
    #[serde(rename = "call:leave")]
    CallLeave(CallRef),
    #[serde(rename = "call:end")]
    CallEnd(CallRef),
    #[serde(rename = "call:signal:offer")]
    CallOffer(CallSessionDescription),
    #[serde(rename = "call:signal:answer")]
    CallAnswer(CallSessionDescription),
    #[serde(rename = "call:signal:ice-candidate")]
    CallIceCandidate(CallIceCandidate),
}

impl ClientRequest {
    /// Wire name of the event.
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join-room",
            Self::RegisterCapabilities(_) => "register-capabilities",
            Self::CreateTransport(_) => "create-transport",
            Self::ConnectTransport(_) => "connect-transport",
            Self::Produce(_) => "produce",
            Self::Consume(_) => "consume",
            Self::ResumeConsumer(_) => "resume-consumer",
            Self::PauseConsumer(_) => "pause-consumer",
            Self::PauseProducer(_) => "pause-producer",
            Self::ResumeProducer(_) => "resume-producer",
            Self::StopScreenShare(_) => "stop-screen-share",
            Self::StopVideo(_) => "stop-video",
            Self::CloseProducer(_) => "close-producer",
            Self::SetScreenShareQuality(_) => "set-screen-share-quality",
            Self::SetMediaState(_) => "set-media-state",
            Self::LeaveRoom(_) => "leave-room",
            Self::Ping(_) => "ping",
            Self::CallStart(_) => "call:start",
            Self::CallJoin(_) => "call:join",
            Self::CallDecline(_) => "call:decline",
            Self::CallLeave(_) => "call:leave",
            Self::CallEnd(_) => "call:end",
            Self::CallOffer(_) => "call:signal:offer",
            Self::CallAnswer(_) => "call:signal:answer",
            Self::CallIceCandidate(_) => "call:signal:ice-candidate",
        }
    }

    /// Encode as a client frame, attaching an ack id when one is given.
    pub fn to_frame(&self, id: Option<u64>) -> Result<String> {
        let mut value = serde_json::to_value(self).map_err(Error::Encode)?;
        if let (Some(id), Some(obj)) = (id, value.as_object_mut()) {
            obj.insert("id".into(), Value::from(id));
        }
        serde_json::to_string(&value).map_err(Error::Encode)
    }
}

/// Client frame before the event payload has been resolved.
///
/// Parsing happens in two steps so the ack id survives a payload that does
/// not match its event.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    /// Ack id, absent for fire-and-forget frames.
    #[serde(default)]
    pub id: Option<u64>,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    /// Parse the envelope of a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::Malformed)
    }

    /// Resolve the payload into a typed request.
    pub fn into_request(self) -> Result<ClientRequest> {
        let data = if self.data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.data
        };
        let tagged = serde_json::json!({ "event": self.event, "data": data });
        serde_json::from_value(tagged).map_err(|e| Error::InvalidRequest {
            event: self.event,
            reason: e.to_string(),
        })
    }
}

/// Payload with no fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCapabilities {
    pub room_id: RoomId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransport {
    pub room_id: RoomId,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub ice_parameters: IceParameters,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: AppData,
    /// Explicit source; inferred from `kind` and `appData` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TrackSource>,
    /// Initial quality for screen video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub room_id: RoomId,
    pub producer_id: ProducerId,
    /// Overrides the registered capabilities for this consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtp_capabilities: Option<RtpCapabilities>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub room_id: RoomId,
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub room_id: RoomId,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetScreenShareQuality {
    pub room_id: RoomId,
    pub producer_id: ProducerId,
    pub quality: Quality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMediaState {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deafened: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStart {
    /// Client-chosen id; the server assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub targets: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: CallId,
}

/// Offer or answer addressed to one call member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSessionDescription {
    pub call_id: CallId,
    pub to: PeerId,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIceCandidate {
    pub call_id: CallId,
    pub to: PeerId,
    pub candidate: IceCandidateInit,
}

// ============================================================================
// Acknowledgment payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub router_rtp_capabilities: RtpCapabilities,
    /// Members already in the room.
    pub peers: Vec<PeerInfo>,
    /// Producers already live in the room.
    pub producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub source: TrackSource,
    pub rtp_parameters: RtpParameters,
    pub producer_paused: bool,
    #[serde(default)]
    pub app_data: AppData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStartResponse {
    pub call_id: CallId,
}

/// Call members already present when joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallJoinResponse {
    pub call_id: CallId,
    pub participants: Vec<PeerId>,
}

// ============================================================================
// Errors
// ============================================================================

/// Stable error codes carried in failed acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CapabilityLoadFailure,
    CapabilitiesNotRegistered,
    TransportCreationFailure,
    TransportConnectFailure,
    TransportNotReady,
    ProduceFailure,
    ConsumeFailure,
    IceFailure,
    RoomNotFound,
    NotInRoom,
    AlreadyJoined,
    RoomFull,
    InvalidState,
    RateLimited,
    Timeout,
    CallNotFound,
    CallAlreadyExists,
    NotInCall,
    InvalidRequest,
    InternalError,
    /// Code not known to this build.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Wire string of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CapabilityLoadFailure => "capability_load_failure",
            Self::CapabilitiesNotRegistered => "capabilities_not_registered",
            Self::TransportCreationFailure => "transport_creation_failure",
            Self::TransportConnectFailure => "transport_connect_failure",
            Self::TransportNotReady => "transport_not_ready",
            Self::ProduceFailure => "produce_failure",
            Self::ConsumeFailure => "consume_failure",
            Self::IceFailure => "ice_failure",
            Self::RoomNotFound => "room_not_found",
            Self::NotInRoom => "not_in_room",
            Self::AlreadyJoined => "already_joined",
            Self::RoomFull => "room_full",
            Self::InvalidState => "invalid_state",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::CallNotFound => "call_not_found",
            Self::CallAlreadyExists => "call_already_exists",
            Self::NotInCall => "not_in_call",
            Self::InvalidRequest => "invalid_request",
            Self::InternalError => "internal_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Acknowledgment of a client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ack: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Ack {
    /// Successful acknowledgment.
    #[must_use]
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            ack: id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed acknowledgment.
    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ack: id,
            ok: false,
            data: None,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Events pushed by the server without a preceding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerNotification {
    /// First frame on every connection.
    #[serde(rename_all = "camelCase")]
    Ready { peer_id: PeerId },
    NewProducer(ProducerInfo),
    PeerJoined(PeerInfo),
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId, username: String },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ProducerResumed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    TransportClosed {
        transport_id: TransportId,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerMediaState { peer_id: PeerId, state: MediaState },
    #[serde(rename_all = "camelCase")]
    ScreenShareQualityChanged {
        peer_id: PeerId,
        producer_id: ProducerId,
        quality: Quality,
    },
    #[serde(rename_all = "camelCase")]
    RoomClosed { room_id: RoomId, reason: String },
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        call_id: CallId,
        from: PeerId,
        username: String,
    },
    #[serde(rename = "call:participant-joined", rename_all = "camelCase")]
    CallParticipantJoined {
        call_id: CallId,
        peer_id: PeerId,
        username: String,
    },
    #[serde(rename = "call:participant-left", rename_all = "camelCase")]
    CallParticipantLeft { call_id: CallId, peer_id: PeerId },
    #[serde(rename = "call:declined", rename_all = "camelCase")]
    CallDeclined { call_id: CallId, peer_id: PeerId },
    #[serde(rename = "call:ended", rename_all = "camelCase")]
    CallEnded {
        call_id: CallId,
        reason: CallEndReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u32>,
    },
    #[serde(rename = "call:signal:offer", rename_all = "camelCase")]
    CallOffer {
        call_id: CallId,
        from: PeerId,
        sdp: String,
    },
    #[serde(rename = "call:signal:answer", rename_all = "camelCase")]
    CallAnswer {
        call_id: CallId,
        from: PeerId,
        sdp: String,
    },
    #[serde(rename = "call:signal:ice-candidate", rename_all = "camelCase")]
    CallIceCandidate {
        call_id: CallId,
        from: PeerId,
        candidate: IceCandidateInit,
    },
}

/// Any frame the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(Ack),
    Notification(ServerNotification),
}

impl ServerFrame {
    /// Parse a server text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::Malformed)
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Encode)
    }
}

impl From<Ack> for ServerFrame {
    fn from(ack: Ack) -> Self {
        Self::Ack(ack)
    }
}

impl From<ServerNotification> for ServerFrame {
    fn from(notification: ServerNotification) -> Self {
        Self::Notification(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_room() {
        let env =
            RequestEnvelope::parse(r#"{"id":1,"event":"join-room","data":{"roomId":"lobby"}}"#)
                .unwrap();
        assert_eq!(env.id, Some(1));
        let request = env.into_request().unwrap();
        assert_eq!(
            request,
            ClientRequest::JoinRoom(RoomRef {
                room_id: RoomId::from("lobby")
            })
        );
    }

    #[test]
    fn test_parse_ping_without_data() {
        let env = RequestEnvelope::parse(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(env.id, None);
        assert!(matches!(env.into_request().unwrap(), ClientRequest::Ping(_)));
    }

    #[test]
    fn test_invalid_payload_keeps_ack_id() {
        let env = RequestEnvelope::parse(r#"{"id":9,"event":"consume","data":{"roomId":"a"}}"#)
            .unwrap();
        assert_eq!(env.id, Some(9));
        let err = env.into_request().unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { ref event, .. } if event == "consume"));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let env = RequestEnvelope::parse(r#"{"id":2,"event":"teleport","data":{}}"#).unwrap();
        assert!(env.into_request().is_err());
        assert!(RequestEnvelope::parse("not json").is_err());
    }

    #[test]
    fn test_call_events_use_colon_names() {
        let request = ClientRequest::CallOffer(CallSessionDescription {
            call_id: CallId::new(),
            to: PeerId::new(),
            sdp: "v=0".into(),
        });
        let frame: Value = serde_json::from_str(&request.to_frame(Some(4)).unwrap()).unwrap();
        assert_eq!(frame["event"], "call:signal:offer");
        assert_eq!(frame["id"], 4);
        assert_eq!(frame["data"]["sdp"], "v=0");
        assert_eq!(request.event(), "call:signal:offer");

        let env = RequestEnvelope::parse(&frame.to_string()).unwrap();
        assert_eq!(env.into_request().unwrap(), request);
    }

    #[test]
    fn test_event_names_match_serialization() {
        let room_id = RoomId::from("r");
        let requests = [
            ClientRequest::JoinRoom(RoomRef {
                room_id: room_id.clone(),
            }),
            ClientRequest::ResumeConsumer(ConsumerRef {
                room_id: room_id.clone(),
                consumer_id: ConsumerId::new(),
            }),
            ClientRequest::SetScreenShareQuality(SetScreenShareQuality {
                room_id,
                producer_id: ProducerId::new(),
                quality: Quality::High,
            }),
            ClientRequest::Ping(Empty {}),
        ];
        for request in requests {
            let value = serde_json::to_value(&request).unwrap();
            assert_eq!(value["event"], request.event());
        }
    }

    #[test]
    fn test_notification_wire_format() {
        let peer_id = PeerId::new();
        let frame = ServerFrame::from(ServerNotification::PeerLeft {
            peer_id,
            username: "ana".into(),
        });
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "peer-left", "data": {"peerId": peer_id, "username": "ana"}})
        );
    }

    #[test]
    fn test_server_frame_distinguishes_acks() {
        let ack = ServerFrame::parse(
            r#"{"ack":3,"ok":false,"error":{"code":"consume_failure","message":"nope"}}"#,
        )
        .unwrap();
        let ServerFrame::Ack(ack) = ack else {
            panic!("expected ack");
        };
        assert_eq!(ack.ack, 3);
        assert_eq!(
            ack.error.map(|e| e.code),
            Some(ErrorCode::ConsumeFailure)
        );

        let note = ServerFrame::parse(&format!(
            r#"{{"event":"ready","data":{{"peerId":"{}"}}}}"#,
            PeerId::new()
        ))
        .unwrap();
        assert!(matches!(
            note,
            ServerFrame::Notification(ServerNotification::Ready { .. })
        ));
    }

    #[test]
    fn test_unknown_error_code_tolerated() {
        let payload: ErrorPayload =
            serde_json::from_str(r#"{"code":"brand_new","message":"x"}"#).unwrap();
        assert_eq!(payload.code, ErrorCode::Unknown);
        assert_eq!(ErrorCode::TransportNotReady.to_string(), "transport_not_ready");
    }
}
