//! Signaling Client
//!
//! WebSocket connection to the signaling server. Every request carries an ack
//! id and resolves when the matching acknowledgment arrives or the deadline
//! passes. Notifications fan out on a broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use vc_common::protocol::{Ack, ClientRequest, ErrorCode, ServerFrame, ServerNotification};
use vc_common::PeerId;

use crate::error::SessionError;

/// Deadline for an acknowledgment when none is configured.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

const NOTIFICATION_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Ack>>>>;

/// Request/notification channel to the signaling server.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Peer id assigned by the server on connect.
    fn peer_id(&self) -> PeerId;

    /// Send a request and wait for its acknowledgment data.
    async fn request(&self, request: ClientRequest) -> Result<Value, SessionError>;

    /// Receive server notifications from now on.
    fn subscribe(&self) -> broadcast::Receiver<ServerNotification>;

    /// Close the connection.
    async fn close(&self);

    /// Resolves once the connection is gone.
    async fn closed(&self);
}

/// Decode acknowledgment data into a typed response.
pub fn decode<T: DeserializeOwned>(data: Value) -> Result<T, SessionError> {
    serde_json::from_value(data).map_err(|e| SessionError::Protocol(vc_common::Error::Malformed(e)))
}

/// Signaling over a WebSocket.
pub struct WsSignaling {
    peer_id: PeerId,
    outgoing: mpsc::Sender<String>,
    pending: PendingAcks,
    next_id: AtomicU64,
    notifications: broadcast::Sender<ServerNotification>,
    ack_timeout: Duration,
    shutdown: CancellationToken,
}

impl WsSignaling {
    /// Connect to `server_url` (http, https, ws or wss) and wait for `ready`.
    pub async fn connect(
        server_url: &str,
        username: &str,
        ack_timeout: Duration,
    ) -> Result<Arc<Self>, SessionError> {
        let url = build_ws_url(server_url, username)?;
        info!(url = %url, "Connecting to signaling server");

        let (stream, _) = connect_async(url.as_str()).await?;
        let (write, mut read) = stream.split();

        let peer_id = tokio::time::timeout(ack_timeout, wait_for_ready(&mut read))
            .await
            .map_err(|_| SessionError::Timeout { event: "ready" })??;

        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let pending = PendingAcks::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_connection(
            write,
            read,
            outgoing_rx,
            pending.clone(),
            notifications.clone(),
            shutdown.clone(),
        ));

        info!(peer_id = %peer_id, "Signaling connected");

        Ok(Arc::new(Self {
            peer_id,
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            notifications,
            ack_timeout,
            shutdown,
        }))
    }

    /// False once the connection has dropped or been closed.
    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled()
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn request(&self, request: ClientRequest) -> Result<Value, SessionError> {
        let event = request.event();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = request.to_frame(Some(id))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.shutdown.is_cancelled() || self.outgoing.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(SessionError::Disconnected);
        }

        let ack = match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(SessionError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!(event, id, "Acknowledgment timed out");
                return Err(SessionError::Timeout { event });
            }
        };

        if ack.ok {
            Ok(ack
                .data
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())))
        } else {
            Err(ack.error.map_or_else(
                || SessionError::Signaling {
                    code: ErrorCode::Unknown,
                    message: format!("'{event}' failed without an error payload"),
                },
                SessionError::from_ack,
            ))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerNotification> {
        self.notifications.subscribe()
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }

    async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Build the WebSocket URL for a server base URL.
fn build_ws_url(server_url: &str, username: &str) -> Result<Url, SessionError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SessionError::InvalidUrl(format!("{server_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SessionError::InvalidUrl(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| SessionError::InvalidUrl(server_url.to_string()))?;
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("username", username);
    Ok(url)
}

async fn wait_for_ready(read: &mut SplitStream<WsStream>) -> Result<PeerId, SessionError> {
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                if let ServerFrame::Notification(ServerNotification::Ready { peer_id }) =
                    ServerFrame::parse(text.as_str())?
                {
                    return Ok(peer_id);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(SessionError::Disconnected)
}

async fn run_connection(
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    mut outgoing: mpsc::Receiver<String>,
    pending: PendingAcks,
    notifications: broadcast::Sender<ServerNotification>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(text.as_str(), &pending, &notifications).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Server closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }

            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                debug!("Sending: {}", frame);
                if let Err(e) = write.send(Message::text(frame)).await {
                    error!("Failed to send message: {}", e);
                    break;
                }
            }

            () = shutdown.cancelled() => {
                info!("Signaling shutdown");
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    shutdown.cancel();
    // Dropping the senders fails every waiting request with `Disconnected`.
    pending.lock().await.clear();
}

async fn dispatch(
    text: &str,
    pending: &PendingAcks,
    notifications: &broadcast::Sender<ServerNotification>,
) {
    match ServerFrame::parse(text) {
        Ok(ServerFrame::Ack(ack)) => {
            let waiter = pending.lock().await.remove(&ack.ack);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(ack);
                }
                None => debug!(id = ack.ack, "Acknowledgment without a waiting request"),
            }
        }
        Ok(ServerFrame::Notification(notification)) => {
            debug!(?notification, "Received");
            let _ = notifications.send(notification);
        }
        Err(e) => {
            warn!("Failed to parse server message: {} - {}", e, text);
        }
    }
}
