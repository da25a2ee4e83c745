//! Join throttling.
//!
//! Each peer gets a deadline before which another `join-room` is refused.
//! Deadlines live in a sharded map so joins from different peers never
//! contend, and a pruner drops the ones that have passed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use vc_common::PeerId;

use super::error::VoiceError;

/// Shortest pruning period, whatever the join interval.
const MIN_PRUNE_PERIOD: Duration = Duration::from_secs(1);

/// Spacing of `join-room` requests per peer.
#[derive(Debug)]
pub struct JoinThrottle {
    spacing: Duration,
    next_join: DashMap<PeerId, Instant>,
}

impl JoinThrottle {
    /// A zero `spacing` admits every join.
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_join: DashMap::new(),
        }
    }

    /// Admit a join and push the peer's deadline out, or refuse it.
    pub fn admit(&self, peer_id: PeerId) -> Result<(), VoiceError> {
        if self.spacing.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        match self.next_join.entry(peer_id) {
            Entry::Occupied(entry) if now < *entry.get() => Err(VoiceError::RateLimited),
            Entry::Occupied(mut entry) => {
                entry.insert(now + self.spacing);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.spacing);
                Ok(())
            }
        }
    }

    /// Drop the peer's deadline once its connection is gone.
    pub fn forget(&self, peer_id: PeerId) {
        self.next_join.remove(&peer_id);
    }

    /// Drop deadlines that have passed. Returns how many remain.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        self.next_join.retain(|_, deadline| *deadline > now);
        self.next_join.len()
    }

    /// Prune periodically until the throttle is dropped.
    pub fn spawn_pruner(self: &Arc<Self>) -> JoinHandle<()> {
        let throttle = Arc::downgrade(self);
        let period = self.spacing.max(MIN_PRUNE_PERIOD);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                let Some(throttle) = throttle.upgrade() else {
                    break;
                };
                let tracked = throttle.prune();
                debug!(tracked, "Join throttle pruned");
            }
        })
    }
}
