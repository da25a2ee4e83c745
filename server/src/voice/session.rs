//! Signaling Sessions
//!
//! One session per WebSocket connection. A session is in at most one room
//! at a time and may take part in any number of mesh calls.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use vc_common::protocol::{Ack, ServerFrame, ServerNotification};
use vc_common::PeerId;

use super::peer::Peer;

/// Outbound frames buffered per session.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Outbound queue of one connection.
///
/// Notifications are never dropped silently: a client that lets its queue
/// fill up has missed state, so the connection is closed and it must
/// reconnect and rejoin.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerFrame>,
    overflow: CancellationToken,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            tx,
            overflow: CancellationToken::new(),
        }
    }

    /// Queue a notification. A full queue closes the connection.
    pub fn notify(&self, peer_id: PeerId, notification: ServerNotification) -> bool {
        match self.tx.try_send(notification.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.overflow.is_cancelled() {
                    warn!(peer_id = %peer_id, "Event queue full, closing session");
                    self.overflow.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    async fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Whether a notification was lost to a full queue.
    pub fn is_overflowed(&self) -> bool {
        self.overflow.is_cancelled()
    }

    /// Resolves once the queue has overflowed.
    pub async fn overflowed(&self) {
        self.overflow.cancelled().await;
    }
}

/// A connected signaling client.
#[derive(Debug)]
pub struct Session {
    peer_id: PeerId,
    username: String,
    outbox: Outbox,
    membership: Mutex<Option<Arc<Peer>>>,
}

impl Session {
    pub fn new(peer_id: PeerId, username: String, tx: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            peer_id,
            username,
            outbox: Outbox::new(tx),
            membership: Mutex::new(None),
        }
    }

    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Resolves once the session must be closed for missing events.
    pub async fn overflowed(&self) {
        self.outbox.overflowed().await;
    }

    /// Current room membership.
    pub fn membership(&self) -> Option<Arc<Peer>> {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_membership(&self, peer: Option<Arc<Peer>>) {
        *self.membership.lock().unwrap_or_else(PoisonError::into_inner) = peer;
    }

    /// Clear membership if it is still `peer`.
    pub(crate) fn clear_membership(&self, peer: &Arc<Peer>) {
        let mut membership = self.membership.lock().unwrap_or_else(PoisonError::into_inner);
        if membership.as_ref().is_some_and(|current| Arc::ptr_eq(current, peer)) {
            *membership = None;
        }
    }

    /// Queue a notification.
    pub fn notify(&self, notification: ServerNotification) -> bool {
        self.outbox.notify(self.peer_id, notification)
    }

    /// Queue an acknowledgment. Acks wait for queue space.
    pub async fn ack(&self, ack: Ack) {
        if !self.outbox.send(ack.into()).await {
            warn!(peer_id = %self.peer_id, "Failed to send ack, connection gone");
        }
    }
}

/// Connected sessions by peer id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<PeerId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.peer_id(), session);
    }

    pub fn remove(&self, peer_id: PeerId) -> Option<Arc<Session>> {
        self.sessions.remove(&peer_id).map(|(_, session)| session)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<Arc<Session>> {
        self.sessions.get(&peer_id).map(|s| s.value().clone())
    }

    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.sessions.contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queue a notification for `peer_id`.
    pub fn send_to(&self, peer_id: PeerId, notification: ServerNotification) -> bool {
        self.get(peer_id)
            .is_some_and(|session| session.notify(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(peer_id: PeerId) -> ServerNotification {
        ServerNotification::Ready { peer_id }
    }

    #[tokio::test]
    async fn test_full_queue_closes_session() {
        let (tx, mut rx) = mpsc::channel(2);
        let session = Session::new(PeerId::new(), "alice".into(), tx);
        let id = session.peer_id();

        assert!(session.notify(ready(id)));
        assert!(session.notify(ready(id)));
        assert!(!session.outbox().is_overflowed());

        assert!(!session.notify(ready(id)));
        tokio::time::timeout(std::time::Duration::from_secs(1), session.overflowed())
            .await
            .unwrap();

        // Queued frames are still delivered.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_peer_outbox_shares_overflow() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(PeerId::new(), "alice".into(), tx);
        let outbox = session.outbox();

        assert!(outbox.notify(session.peer_id(), ready(session.peer_id())));
        assert!(!outbox.notify(session.peer_id(), ready(session.peer_id())));
        assert!(session.outbox().is_overflowed());
    }

    #[tokio::test]
    async fn test_closed_queue_is_not_overflow() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let session = Session::new(PeerId::new(), "alice".into(), tx);
        assert!(!session.notify(ready(session.peer_id())));
        assert!(!session.outbox().is_overflowed());
    }
}
