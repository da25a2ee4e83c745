//! Call service for mesh voice calls.
//!
//! Keeps call state in memory, fans call events out to the involved
//! sessions and relays offer/answer/candidate messages between members.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use vc_common::protocol::{CallIceCandidate, CallSessionDescription, ServerNotification};
use vc_common::{CallEndReason, CallId, PeerId};

use super::call::{CallEventType, CallState};
use super::error::VoiceError;
use super::session::{Session, SessionRegistry};

#[derive(Debug, Clone)]
struct CallEntry {
    initiator: PeerId,
    state: CallState,
}

/// Mesh call bookkeeping.
#[derive(Debug)]
pub struct CallService {
    calls: DashMap<CallId, CallEntry>,
    sessions: Arc<SessionRegistry>,
    ring_timeout: Duration,
}

impl CallService {
    pub fn new(sessions: Arc<SessionRegistry>, ring_timeout: Duration) -> Self {
        Self {
            calls: DashMap::new(),
            sessions,
            ring_timeout,
        }
    }

    /// Current state of a call.
    pub fn get_call_state(&self, call_id: CallId) -> Option<CallState> {
        self.calls.get(&call_id).map(|entry| entry.state.clone())
    }

    /// Calls currently ringing or active.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    fn notify_all(
        &self,
        audience: impl IntoIterator<Item = PeerId>,
        except: Option<PeerId>,
        notification: &ServerNotification,
    ) {
        for peer_id in audience {
            if Some(peer_id) != except {
                self.sessions.send_to(peer_id, notification.clone());
            }
        }
    }

    /// Apply `event`, notify on end, and drop ended calls.
    fn apply(
        &self,
        call_id: CallId,
        event: &CallEventType,
    ) -> Result<(CallState, HashSet<PeerId>), VoiceError> {
        let mut entry = self
            .calls
            .get_mut(&call_id)
            .ok_or(VoiceError::CallNotFound(call_id))?;
        let audience = entry.state.audience();
        let next = entry.state.clone().apply(event)?;
        entry.state = next.clone();
        drop(entry);

        if let CallState::Ended {
            reason,
            duration_secs,
            ..
        } = &next
        {
            self.calls.remove(&call_id);
            info!(call_id = %call_id, reason = ?reason, "Call ended");
            let ended = ServerNotification::CallEnded {
                call_id,
                reason: *reason,
                duration_secs: *duration_secs,
            };
            self.notify_all(audience.iter().copied(), None, &ended);
        }
        Ok((next, audience))
    }

    /// Start ringing `targets`.
    pub fn start_call(
        self: &Arc<Self>,
        initiator: &Session,
        call_id: Option<CallId>,
        targets: Vec<PeerId>,
    ) -> Result<CallId, VoiceError> {
        let targets: HashSet<PeerId> = targets.into_iter().collect();
        if targets.is_empty() {
            return Err(VoiceError::InvalidRequest("call needs at least one target".into()));
        }
        if targets.contains(&initiator.peer_id()) {
            return Err(VoiceError::InvalidRequest("cannot call yourself".into()));
        }
        if let Some(offline) = targets.iter().find(|t| !self.sessions.is_connected(**t)) {
            return Err(VoiceError::InvalidRequest(format!(
                "peer {offline} is not connected"
            )));
        }

        let call_id = call_id.unwrap_or_default();
        match self.calls.entry(call_id) {
            Entry::Occupied(_) => return Err(VoiceError::CallAlreadyExists(call_id)),
            Entry::Vacant(slot) => {
                slot.insert(CallEntry {
                    initiator: initiator.peer_id(),
                    state: CallState::new_ringing(initiator.peer_id(), targets.clone()),
                });
            }
        }

        let incoming = ServerNotification::CallIncoming {
            call_id,
            from: initiator.peer_id(),
            username: initiator.username().to_string(),
        };
        self.notify_all(targets.iter().copied(), Some(initiator.peer_id()), &incoming);
        self.spawn_ring_timer(call_id);

        info!(
            call_id = %call_id,
            initiator = %initiator.peer_id(),
            targets = targets.len(),
            "Call started"
        );
        Ok(call_id)
    }

    fn spawn_ring_timer(self: &Arc<Self>, call_id: CallId) {
        let service: Weak<Self> = Arc::downgrade(self);
        let timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(service) = service.upgrade() else {
                return;
            };
            let ringing = service
                .calls
                .get(&call_id)
                .is_some_and(|entry| entry.state.is_ringing());
            if ringing {
                debug!(call_id = %call_id, "Call not answered");
                let _ = service.apply(
                    call_id,
                    &CallEventType::Ended {
                        reason: CallEndReason::NoAnswer,
                    },
                );
            }
        });
    }

    /// Join a call. Returns the other participants.
    pub fn join_call(&self, session: &Session, call_id: CallId) -> Result<Vec<PeerId>, VoiceError> {
        let peer_id = session.peer_id();
        let (state, audience) = self.apply(call_id, &CallEventType::Joined { peer_id })?;

        let joined = ServerNotification::CallParticipantJoined {
            call_id,
            peer_id,
            username: session.username().to_string(),
        };
        self.notify_all(audience, Some(peer_id), &joined);

        Ok(state
            .participants()
            .map(|p| p.iter().copied().filter(|id| *id != peer_id).collect())
            .unwrap_or_default())
    }

    /// Decline a ringing call.
    pub fn decline_call(&self, peer_id: PeerId, call_id: CallId) -> Result<CallState, VoiceError> {
        let (state, audience) = self.apply(call_id, &CallEventType::Declined { peer_id })?;
        if state.is_active() {
            let declined = ServerNotification::CallDeclined { call_id, peer_id };
            self.notify_all(audience, Some(peer_id), &declined);
        }
        Ok(state)
    }

    /// Leave a call.
    ///
    /// The initiator leaving a ringing call cancels it; a target leaving a
    /// ringing call (or an invited peer that never joined) declines it.
    pub fn leave_call(&self, peer_id: PeerId, call_id: CallId) -> Result<CallState, VoiceError> {
        let (initiator, state) = self
            .calls
            .get(&call_id)
            .map(|entry| (entry.initiator, entry.state.clone()))
            .ok_or(VoiceError::CallNotFound(call_id))?;

        match &state {
            CallState::Ringing { .. } if initiator == peer_id => {
                let (state, _) = self.apply(
                    call_id,
                    &CallEventType::Ended {
                        reason: CallEndReason::Cancelled,
                    },
                )?;
                Ok(state)
            }
            CallState::Ringing { .. } => self.decline_call(peer_id, call_id),
            CallState::Active { participants, .. } if participants.contains(&peer_id) => {
                let (state, audience) = self.apply(call_id, &CallEventType::Left { peer_id })?;
                if state.is_active() {
                    let left = ServerNotification::CallParticipantLeft { call_id, peer_id };
                    self.notify_all(audience, Some(peer_id), &left);
                }
                Ok(state)
            }
            CallState::Active { invited, .. } if invited.contains(&peer_id) => {
                self.decline_call(peer_id, call_id)
            }
            _ => Err(VoiceError::NotInCall(call_id)),
        }
    }

    /// End a call for everyone.
    pub fn end_call(&self, peer_id: PeerId, call_id: CallId) -> Result<CallState, VoiceError> {
        let (initiator, state) = self
            .calls
            .get(&call_id)
            .map(|entry| (entry.initiator, entry.state.clone()))
            .ok_or(VoiceError::CallNotFound(call_id))?;
        let allowed = match &state {
            CallState::Ringing { .. } => initiator == peer_id,
            CallState::Active { participants, .. } => participants.contains(&peer_id),
            CallState::Ended { .. } => false,
        };
        if !allowed {
            return Err(VoiceError::NotInCall(call_id));
        }
        let reason = if state.is_ringing() {
            CallEndReason::Cancelled
        } else {
            CallEndReason::HungUp
        };
        let (state, _) = self.apply(call_id, &CallEventType::Ended { reason })?;
        Ok(state)
    }

    /// Both `from` and `to` must be joined participants of an active call.
    fn ensure_members(&self, call_id: CallId, from: PeerId, to: PeerId) -> Result<(), VoiceError> {
        let entry = self
            .calls
            .get(&call_id)
            .ok_or(VoiceError::CallNotFound(call_id))?;
        match entry.state.participants() {
            Some(participants) if participants.contains(&from) && participants.contains(&to) => {
                Ok(())
            }
            _ => Err(VoiceError::NotInCall(call_id)),
        }
    }

    pub fn relay_offer(&self, from: PeerId, offer: CallSessionDescription) -> Result<(), VoiceError> {
        self.ensure_members(offer.call_id, from, offer.to)?;
        self.sessions.send_to(
            offer.to,
            ServerNotification::CallOffer {
                call_id: offer.call_id,
                from,
                sdp: offer.sdp,
            },
        );
        Ok(())
    }

    pub fn relay_answer(
        &self,
        from: PeerId,
        answer: CallSessionDescription,
    ) -> Result<(), VoiceError> {
        self.ensure_members(answer.call_id, from, answer.to)?;
        self.sessions.send_to(
            answer.to,
            ServerNotification::CallAnswer {
                call_id: answer.call_id,
                from,
                sdp: answer.sdp,
            },
        );
        Ok(())
    }

    pub fn relay_ice_candidate(
        &self,
        from: PeerId,
        candidate: CallIceCandidate,
    ) -> Result<(), VoiceError> {
        self.ensure_members(candidate.call_id, from, candidate.to)?;
        self.sessions.send_to(
            candidate.to,
            ServerNotification::CallIceCandidate {
                call_id: candidate.call_id,
                from,
                candidate: candidate.candidate,
            },
        );
        Ok(())
    }

    /// Leave every call `peer_id` is involved in (on disconnect).
    pub fn leave_all(&self, peer_id: PeerId) {
        let calls: Vec<CallId> = self
            .calls
            .iter()
            .filter(|entry| entry.state.involves(peer_id))
            .map(|entry| *entry.key())
            .collect();
        for call_id in calls {
            if let Err(e) = self.leave_call(peer_id, call_id) {
                debug!(call_id = %call_id, peer_id = %peer_id, error = %e, "Leave on disconnect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use vc_common::protocol::ServerFrame;
    use vc_common::IceCandidateInit;

    struct Client {
        session: Arc<Session>,
        rx: mpsc::Receiver<ServerFrame>,
    }

    impl Client {
        fn next(&mut self) -> ServerNotification {
            match self.rx.try_recv() {
                Ok(ServerFrame::Notification(n)) => n,
                other => panic!("expected notification, got {other:?}"),
            }
        }

        fn is_quiet(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn setup(n: usize, ring: Duration) -> (Arc<CallService>, Vec<Client>) {
        let sessions = Arc::new(SessionRegistry::new());
        let clients = (0..n)
            .map(|i| {
                let (tx, rx) = mpsc::channel(32);
                let session = Arc::new(Session::new(PeerId::new(), format!("user{i}"), tx));
                sessions.insert(session.clone());
                Client { session, rx }
            })
            .collect();
        (Arc::new(CallService::new(sessions, ring)), clients)
    }

    #[tokio::test]
    async fn test_start_rings_targets() {
        let (service, mut c) = setup(2, Duration::from_secs(60));
        let target = c[1].session.peer_id();
        let call_id = service.start_call(&c[0].session, None, vec![target]).unwrap();

        match c[1].next() {
            ServerNotification::CallIncoming { call_id: id, from, username } => {
                assert_eq!(id, call_id);
                assert_eq!(from, c[0].session.peer_id());
                assert_eq!(username, "user0");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(c[0].is_quiet());
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let (service, c) = setup(2, Duration::from_secs(60));
        let target = c[1].session.peer_id();
        let call_id = CallId::new();
        service
            .start_call(&c[0].session, Some(call_id), vec![target])
            .unwrap();
        assert!(matches!(
            service.start_call(&c[0].session, Some(call_id), vec![target]),
            Err(VoiceError::CallAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_target_rejected() {
        let (service, c) = setup(1, Duration::from_secs(60));
        assert!(matches!(
            service.start_call(&c[0].session, None, vec![PeerId::new()]),
            Err(VoiceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_join_then_relay_offer() {
        let (service, mut c) = setup(3, Duration::from_secs(60));
        let a = c[0].session.peer_id();
        let b = c[1].session.peer_id();
        let stranger = c[2].session.peer_id();
        let call_id = service.start_call(&c[0].session, None, vec![b]).unwrap();
        c[1].next();

        let others = service.join_call(&c[1].session, call_id).unwrap();
        assert_eq!(others, vec![a]);
        assert!(matches!(
            c[0].next(),
            ServerNotification::CallParticipantJoined { peer_id, .. } if peer_id == b
        ));

        service
            .relay_offer(
                b,
                CallSessionDescription {
                    call_id,
                    to: a,
                    sdp: "v=0".into(),
                },
            )
            .unwrap();
        assert!(matches!(
            c[0].next(),
            ServerNotification::CallOffer { from, .. } if from == b
        ));

        assert!(matches!(
            service.relay_ice_candidate(
                stranger,
                CallIceCandidate {
                    call_id,
                    to: a,
                    candidate: IceCandidateInit {
                        candidate: "candidate:1".into(),
                        sdp_mid: None,
                        sdp_m_line_index: None,
                        username_fragment: None,
                    },
                },
            ),
            Err(VoiceError::NotInCall(_))
        ));
        assert!(c[0].is_quiet());
    }

    #[tokio::test]
    async fn test_initiator_leaving_while_ringing_cancels() {
        let (service, mut c) = setup(2, Duration::from_secs(60));
        let b = c[1].session.peer_id();
        let call_id = service.start_call(&c[0].session, None, vec![b]).unwrap();
        c[1].next();

        let state = service.leave_call(c[0].session.peer_id(), call_id).unwrap();
        assert!(matches!(
            state,
            CallState::Ended {
                reason: CallEndReason::Cancelled,
                ..
            }
        ));
        assert!(matches!(
            c[1].next(),
            ServerNotification::CallEnded {
                reason: CallEndReason::Cancelled,
                ..
            }
        ));
        assert_eq!(service.active_calls(), 0);
    }

    #[tokio::test]
    async fn test_decline_by_only_target_ends_call() {
        let (service, mut c) = setup(2, Duration::from_secs(60));
        let b = c[1].session.peer_id();
        let call_id = service.start_call(&c[0].session, None, vec![b]).unwrap();

        service.decline_call(b, call_id).unwrap();
        assert!(matches!(
            c[0].next(),
            ServerNotification::CallEnded {
                reason: CallEndReason::AllDeclined,
                ..
            }
        ));
        assert!(service.get_call_state(call_id).is_none());
    }

    #[tokio::test]
    async fn test_last_leave_ends_with_duration() {
        let (service, mut c) = setup(2, Duration::from_secs(60));
        let a = c[0].session.peer_id();
        let b = c[1].session.peer_id();
        let call_id = service.start_call(&c[0].session, None, vec![b]).unwrap();
        service.join_call(&c[1].session, call_id).unwrap();
        c[1].next();
        c[0].next();

        service.leave_all(a);
        match c[1].next() {
            ServerNotification::CallEnded {
                reason,
                duration_secs,
                ..
            } => {
                assert_eq!(reason, CallEndReason::LastLeft);
                assert!(duration_secs.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let (service, mut c) = setup(2, Duration::from_millis(20));
        let b = c[1].session.peer_id();
        let call_id = service.start_call(&c[0].session, None, vec![b]).unwrap();
        c[1].next();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.get_call_state(call_id).is_none());
        assert!(matches!(
            c[0].next(),
            ServerNotification::CallEnded {
                reason: CallEndReason::NoAnswer,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_end_requires_membership() {
        let (service, c) = setup(3, Duration::from_secs(60));
        let b = c[1].session.peer_id();
        let call_id = service.start_call(&c[0].session, None, vec![b]).unwrap();
        assert!(matches!(
            service.end_call(c[2].session.peer_id(), call_id),
            Err(VoiceError::NotInCall(_))
        ));
        service.join_call(&c[1].session, call_id).unwrap();
        assert!(matches!(
            service.end_call(b, call_id).unwrap(),
            CallState::Ended {
                reason: CallEndReason::HungUp,
                ..
            }
        ));
    }
}
