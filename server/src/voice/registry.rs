//! Router Registry
//!
//! Maps room ids to routers. The first joiner of a room creates the router
//! on the next worker; concurrent joiners wait on the same cell and receive
//! the same instance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use vc_common::RoomId;

use crate::engine::{EngineError, Router, WorkerPool};

type RouterSlot = Arc<OnceCell<Arc<Router>>>;

/// One router per room.
#[derive(Debug)]
pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    routers: DashMap<RoomId, RouterSlot>,
    created: AtomicUsize,
}

impl RouterRegistry {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            routers: DashMap::new(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Routers created since startup.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Rooms with a live router.
    pub fn len(&self) -> usize {
        self.routers
            .iter()
            .filter(|slot| slot.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a router for `room_id` on the next worker.
    pub async fn create_router(&self, room_id: &RoomId) -> Result<Arc<Router>, EngineError> {
        let worker = self.pool.next_worker();
        let router = worker.create_router().await?;
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(
            room_id = %room_id,
            router_id = %router.id(),
            worker_id = worker.id(),
            "Router assigned to room"
        );
        Ok(router)
    }

    /// Router of `room_id`, creating it if absent.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<Router>, EngineError> {
        loop {
            // Guard released before awaiting.
            let slot = self
                .routers
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value()
                .clone();

            let router = slot
                .get_or_try_init(|| self.create_router(room_id))
                .await?
                .clone();

            if !router.is_closed() {
                return Ok(router);
            }

            // Stale router (worker died or room closed): drop the slot and retry.
            self.routers
                .remove_if(room_id, |_, current| Arc::ptr_eq(current, &slot));
            debug!(room_id = %room_id, "Discarded closed router");
        }
    }

    /// Existing router of `room_id`.
    pub fn get_router(&self, room_id: &RoomId) -> Option<Arc<Router>> {
        self.routers
            .get(room_id)
            .and_then(|slot| slot.get().cloned())
            .filter(|router| !router.is_closed())
    }

    /// Unregister `room_id` without closing its router.
    pub(crate) fn unregister(&self, room_id: &RoomId) -> Option<Arc<Router>> {
        self.routers
            .remove(room_id)
            .and_then(|(_, slot)| slot.get().cloned())
    }

    /// Unregister `router` if it is still the one serving `room_id`.
    pub(crate) fn discard(&self, room_id: &RoomId, router: &Arc<Router>) -> bool {
        self.routers
            .remove_if(room_id, |_, slot| {
                slot.get().is_some_and(|current| Arc::ptr_eq(current, router))
            })
            .is_some()
    }

    /// Close and unregister the router of `room_id`.
    pub fn close_router(&self, room_id: &RoomId) -> bool {
        match self.unregister(room_id) {
            Some(router) => {
                router.close();
                debug!(room_id = %room_id, router_id = %router.id(), "Router released");
                true
            }
            None => false,
        }
    }
}
