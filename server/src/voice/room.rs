//! Rooms
//!
//! Membership of one room plus the router serving it. The peer map lock is
//! also the announcement lock: joins take it exclusively while snapshotting
//! existing producers, produce holds it shared while publishing, so every
//! member learns of every producer exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock, RwLockReadGuard, RwLockWriteGuard};
use vc_common::protocol::ServerNotification;
use vc_common::{PeerId, PeerInfo, RoomId};

use super::error::VoiceError;
use super::peer::Peer;
use crate::engine::{CloseReport, Router};

/// A voice/video room.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    router: OnceCell<Arc<Router>>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    max_peers: usize,
    pending: AtomicUsize,
}

/// Decrements the pending-join counter when dropped.
#[derive(Debug)]
pub struct PendingJoin {
    room: Arc<Room>,
}

impl PendingJoin {
    pub const fn room(&self) -> &Arc<Room> {
        &self.room
    }
}

impl Drop for PendingJoin {
    fn drop(&mut self) {
        self.room.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Room {
    pub fn new(id: RoomId, max_peers: usize) -> Self {
        Self {
            id,
            router: OnceCell::new(),
            peers: RwLock::new(HashMap::new()),
            max_peers,
            pending: AtomicUsize::new(0),
        }
    }

    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn router(&self) -> Option<&Arc<Router>> {
        self.router.get()
    }

    /// Attach the room's router. Returns true the first time only.
    pub fn attach_router(&self, router: Arc<Router>) -> bool {
        self.router.set(router).is_ok()
    }

    /// Register an in-flight join. Must be called while the room map entry is held.
    pub fn begin_join(self: &Arc<Self>) -> PendingJoin {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingJoin { room: self.clone() }
    }

    /// No members and no joins in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
            && self.peers.try_read().is_ok_and(|peers| peers.is_empty())
    }

    pub async fn peers(&self) -> RwLockReadGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.peers.read().await
    }

    pub async fn peers_mut(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.peers.write().await
    }

    /// Insert `peer` into a locked peer map, enforcing capacity.
    pub fn insert_peer(
        &self,
        peers: &mut HashMap<PeerId, Arc<Peer>>,
        peer: Arc<Peer>,
    ) -> Result<(), VoiceError> {
        if peers.contains_key(&peer.id()) {
            return Err(VoiceError::AlreadyJoined(self.id.clone()));
        }
        if peers.len() >= self.max_peers {
            return Err(VoiceError::RoomFull {
                max_peers: self.max_peers,
            });
        }
        peers.insert(peer.id(), peer);
        Ok(())
    }

    pub async fn remove_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.write().await.remove(&peer_id)
    }

    pub async fn get_peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Info of every member except `exclude`.
    pub async fn peer_infos_except(&self, exclude: PeerId) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| peer.id() != exclude)
            .map(|peer| peer.info())
            .collect()
    }

    /// Send to one member.
    pub async fn notify(&self, peer_id: PeerId, notification: ServerNotification) -> bool {
        match self.get_peer(peer_id).await {
            Some(peer) => peer.notify(notification),
            None => false,
        }
    }

    /// Broadcast an event to all peers except one.
    ///
    /// Clones the peer list before sending to avoid holding the lock while
    /// queueing.
    pub async fn broadcast_except(&self, exclude: PeerId, notification: ServerNotification) {
        let peers: Vec<Arc<Peer>> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|peer| peer.id() != exclude)
                .cloned()
                .collect()
        };
        for peer in peers {
            peer.notify(notification.clone());
        }
    }

    /// Tell members about engine objects that closed.
    ///
    /// Subscribers get `consumer-closed`, everyone but the owner gets
    /// `producer-closed`, and owners' media state is kept in sync.
    pub async fn notify_closures(&self, report: &CloseReport) {
        for consumer in &report.consumers {
            if let Some(peer) = self.get_peer(consumer.peer_id()).await {
                peer.consumers().lock().await.remove(&consumer.producer_id());
                peer.notify(ServerNotification::ConsumerClosed {
                    consumer_id: consumer.id(),
                    producer_id: consumer.producer_id(),
                });
            }
        }

        for producer in &report.producers {
            let owner = producer.peer_id();
            let changed = match self.get_peer(owner).await {
                Some(peer) => peer.remove_producer(producer.id()),
                None => None,
            };
            self.broadcast_except(
                owner,
                ServerNotification::ProducerClosed {
                    producer_id: producer.id(),
                    peer_id: owner,
                },
            )
            .await;
            if let Some((source, state)) = changed {
                if source.is_screen() || source == vc_common::TrackSource::Camera {
                    self.broadcast_except(
                        owner,
                        ServerNotification::PeerMediaState {
                            peer_id: owner,
                            state,
                        },
                    )
                    .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::session::Outbox;
    use tokio::sync::mpsc;
    use vc_common::protocol::ServerFrame;

    fn peer(room: &RoomId) -> (Arc<Peer>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(Peer::new(
                PeerId::new(),
                "p".into(),
                room.clone(),
                Outbox::new(tx),
            )),
            rx,
        )
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let room = Room::new(RoomId::from("small"), 1);
        let (a, _ra) = peer(room.id());
        let (b, _rb) = peer(room.id());

        let mut peers = room.peers_mut().await;
        room.insert_peer(&mut peers, a.clone()).unwrap();
        assert!(matches!(
            room.insert_peer(&mut peers, a),
            Err(VoiceError::AlreadyJoined(_))
        ));
        assert!(matches!(
            room.insert_peer(&mut peers, b),
            Err(VoiceError::RoomFull { max_peers: 1 })
        ));
    }

    #[tokio::test]
    async fn test_pending_join_blocks_idle() {
        let room = Arc::new(Room::new(RoomId::from("r"), 4));
        assert!(room.is_idle());
        let pending = room.begin_join();
        assert!(!room.is_idle());
        drop(pending);
        assert!(room.is_idle());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let room = Room::new(RoomId::from("r"), 4);
        let (a, mut ra) = peer(room.id());
        let (b, mut rb) = peer(room.id());
        {
            let mut peers = room.peers_mut().await;
            room.insert_peer(&mut peers, a.clone()).unwrap();
            room.insert_peer(&mut peers, b.clone()).unwrap();
        }

        room.broadcast_except(
            a.id(),
            ServerNotification::PeerLeft {
                peer_id: a.id(),
                username: "p".into(),
            },
        )
        .await;

        assert!(rb.try_recv().is_ok());
        assert!(ra.try_recv().is_err());
    }
}
