//! End-to-end tests over a real WebSocket connection and the HTTP router.

mod helpers;

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use helpers::{spawn_test_server, RECV_TIMEOUT};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;
use vc_common::protocol::{ErrorCode, ServerFrame, ServerNotification};
use vc_sfu::api::{create_router, AppState, HealthResponse};
use vc_sfu::config::Config;
use vc_sfu::engine::WorkerPool;
use vc_sfu::voice::IceServersResponse;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr, username: &str) -> (Socket, ServerNotification) {
    let url = format!("ws://{addr}/ws?username={username}");
    let (mut socket, _) = connect_async(url).await.expect("websocket connect");
    let ready = next_frame(&mut socket).await;
    match ready {
        ServerFrame::Notification(n @ ServerNotification::Ready { .. }) => (socket, n),
        other => panic!("expected ready, got {other:?}"),
    }
}

async fn next_frame(socket: &mut Socket) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("frame before timeout")
            .expect("socket open")
            .expect("websocket message");
        if let Message::Text(text) = msg {
            return ServerFrame::parse(text.as_str()).expect("server frame");
        }
    }
}

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(Message::text(frame.to_string()))
        .await
        .expect("send frame");
}

/// Send a request and wait for its ack, collecting notifications on the way.
async fn request(socket: &mut Socket, id: u64, event: &str, data: Value) -> vc_common::protocol::Ack {
    send(socket, json!({ "id": id, "event": event, "data": data })).await;
    loop {
        if let ServerFrame::Ack(ack) = next_frame(socket).await {
            assert_eq!(ack.ack, id);
            return ack;
        }
    }
}

#[tokio::test]
async fn test_join_over_websocket() {
    let (addr, _state, server) = spawn_test_server(Config::default_for_test()).await;
    let (mut socket, _) = connect(addr, "alice").await;

    let ack = request(&mut socket, 1, "join-room", json!({ "roomId": "room-1" })).await;
    assert!(ack.ok, "join failed: {:?}", ack.error);
    let data = ack.data.unwrap();
    assert!(data["routerRtpCapabilities"]["codecs"].as_array().is_some_and(|c| !c.is_empty()));
    assert_eq!(data["peers"], json!([]));

    let ack = request(
        &mut socket,
        2,
        "create-transport",
        json!({ "roomId": "room-1", "direction": "send" }),
    )
    .await;
    assert!(ack.ok);
    let data = ack.data.unwrap();
    assert!(data["id"].is_string());
    assert!(data["iceParameters"]["usernameFragment"].is_string());
    assert!(data["dtlsParameters"]["fingerprints"].as_array().is_some_and(|f| !f.is_empty()));
    assert!(data["iceServers"].as_array().is_some_and(|s| !s.is_empty()));

    server.abort();
}

#[tokio::test]
async fn test_bad_request_keeps_session_alive() {
    let (addr, _state, server) = spawn_test_server(Config::default_for_test()).await;
    let (mut socket, _) = connect(addr, "alice").await;

    // payload does not fit the event
    let ack = request(&mut socket, 7, "join-room", json!({ "room": 5 })).await;
    assert!(!ack.ok);
    assert_eq!(ack.error.unwrap().code, ErrorCode::InvalidRequest);

    // unknown event
    let ack = request(&mut socket, 8, "teleport", json!({})).await;
    assert_eq!(ack.error.unwrap().code, ErrorCode::InvalidRequest);

    // not joined
    let ack = request(
        &mut socket,
        9,
        "create-transport",
        json!({ "roomId": "room-1", "direction": "recv" }),
    )
    .await;
    assert_eq!(ack.error.unwrap().code, ErrorCode::NotInRoom);

    // garbage is dropped without an ack, the session survives
    socket.send(Message::text("not json")).await.unwrap();
    let ack = request(&mut socket, 10, "ping", json!({})).await;
    assert!(ack.ok);

    server.abort();
}

#[tokio::test]
async fn test_socket_close_broadcasts_peer_left() {
    let (addr, _state, server) = spawn_test_server(Config::default_for_test()).await;
    let (mut alice, _) = connect(addr, "alice").await;
    let (mut bob, bob_ready) = connect(addr, "bob").await;
    let ServerNotification::Ready { peer_id: bob_id } = bob_ready else {
        unreachable!()
    };

    assert!(request(&mut alice, 1, "join-room", json!({ "roomId": "room-1" })).await.ok);
    assert!(request(&mut bob, 1, "join-room", json!({ "roomId": "room-1" })).await.ok);

    match next_frame(&mut alice).await {
        ServerFrame::Notification(ServerNotification::PeerJoined(peer)) => {
            assert_eq!(peer.peer_id, bob_id);
            assert_eq!(peer.username, "bob");
        }
        other => panic!("expected peer-joined, got {other:?}"),
    }

    bob.close(None).await.unwrap();

    match next_frame(&mut alice).await {
        ServerFrame::Notification(ServerNotification::PeerLeft { peer_id, username }) => {
            assert_eq!(peer_id, bob_id);
            assert_eq!(username, "bob");
        }
        other => panic!("expected peer-left, got {other:?}"),
    }

    server.abort();
}

#[tokio::test]
async fn test_blank_username_rejected() {
    let (addr, _state, server) = spawn_test_server(Config::default_for_test()).await;
    let result = connect_async(format!("ws://{addr}/ws?username=%20")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
    server.abort();
}

fn app_state(config: Config) -> AppState {
    let pool = WorkerPool::new(config.media_workers, config.worker_settings()).unwrap();
    AppState::new(config, pool)
}

#[tokio::test]
async fn test_ice_servers_endpoint() {
    let config = Config {
        turn_server: Some("turn:turn.example.com:3478".into()),
        turn_username: Some("user".into()),
        turn_credential: Some("secret".into()),
        ..Config::default_for_test()
    };
    let app = create_router(app_state(config));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/voice/ice-servers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let servers: IceServersResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(servers.ice_servers.len(), 2);
    assert_eq!(servers.ice_servers[1].username.as_deref(), Some("user"));
}

#[tokio::test]
async fn test_health_reports_workers() {
    let app = create_router(app_state(Config::default_for_test()));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.workers_alive, 2);
}
