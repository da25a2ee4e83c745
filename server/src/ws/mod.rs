//! WebSocket Handler
//!
//! Signaling transport: one connection per client, text frames carrying
//! requests, acks and notifications.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::api::AppState;

/// Longest accepted display name.
pub const MAX_USERNAME_LEN: usize = 64;

/// Close code sent when a client falls too far behind on events
/// ("try again later").
pub const CLOSE_EVENT_OVERFLOW: u16 = 1013;

const CLOSE_FRAME_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// WebSocket connection query params.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Display name shown to other peers.
    pub username: String,
}

impl WsQuery {
    /// Trimmed username, if acceptable.
    fn validated_username(&self) -> Option<String> {
        let username = self.username.trim();
        if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
            return None;
        }
        Some(username.to_string())
    }
}

/// WebSocket upgrade handler.
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let Some(username) = query.validated_username() else {
        return (StatusCode::BAD_REQUEST, "Invalid username").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, username))
}

/// Handle WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, username: String) {
    let (mut ws_sender, mut ws_receiver): (SplitSink<WebSocket, Message>, SplitStream<WebSocket>) =
        socket.split();

    let signaling = state.signaling.clone();
    let (session, mut rx) = signaling.connect(username);
    let peer_id = session.peer_id();

    // Spawn task to forward frames to WebSocket
    let outbox = session.outbox();
    let mut sender_handle: tokio::task::JoinHandle<()> = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                () = outbox.overflowed() => {
                    let close = CloseFrame {
                        code: CLOSE_EVENT_OVERFLOW,
                        reason: "event queue overflow".into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(close))).await;
                    break;
                }
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let msg = match frame.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!(peer_id = %peer_id, error = %e, "Failed to serialize frame");
                    continue;
                }
            };

            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Handle incoming messages in order
    loop {
        let msg = tokio::select! {
            () = session.overflowed() => {
                warn!(peer_id = %peer_id, "Closing session that missed events");
                break;
            }
            msg = ws_receiver.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        match msg {
            Ok(Message::Text(text)) => {
                signaling.handle_frame(&session, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!(peer_id = %peer_id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => {
                info!(peer_id = %peer_id, "WebSocket closed");
                break;
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "WebSocket error");
                break;
            }
            // Axum answers pings itself
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
        }
    }

    // Cleanup
    signaling.disconnect(&session).await;
    let overflowed = session.outbox().is_overflowed();
    drop(session);
    // Let the close frame go out.
    if !overflowed
        || tokio::time::timeout(CLOSE_FRAME_GRACE, &mut sender_handle)
            .await
            .is_err()
    {
        sender_handle.abort();
    }

    info!(peer_id = %peer_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_is_trimmed() {
        let query = WsQuery {
            username: "  alice ".into(),
        };
        assert_eq!(query.validated_username().as_deref(), Some("alice"));
    }

    #[test]
    fn test_blank_or_long_username_rejected() {
        let blank = WsQuery {
            username: "   ".into(),
        };
        assert!(blank.validated_username().is_none());

        let long = WsQuery {
            username: "x".repeat(MAX_USERNAME_LEN + 1),
        };
        assert!(long.validated_username().is_none());
    }
}
