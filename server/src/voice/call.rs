//! Mesh Call State
//!
//! Calls are a small state machine driven by events: ringing until someone
//! joins, active while at least two participants remain, then ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use vc_common::{CallEndReason, PeerId};

/// Events applied to a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEventType {
    Joined { peer_id: PeerId },
    Left { peer_id: PeerId },
    Declined { peer_id: PeerId },
    Ended { reason: CallEndReason },
}

/// Current state of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallState {
    Ringing {
        started_by: PeerId,
        started_at: DateTime<Utc>,
        declined_by: HashSet<PeerId>,
        targets: HashSet<PeerId>,
    },
    Active {
        started_at: DateTime<Utc>,
        participants: HashSet<PeerId>,
        invited: HashSet<PeerId>,
    },
    Ended {
        reason: CallEndReason,
        duration_secs: Option<u32>,
        ended_at: DateTime<Utc>,
    },
}

fn elapsed_secs(since: DateTime<Utc>) -> u32 {
    u32::try_from(Utc::now().signed_duration_since(since).num_seconds().max(0)).unwrap_or(u32::MAX)
}

impl CallState {
    /// Create initial ringing state
    pub fn new_ringing(initiator: PeerId, targets: HashSet<PeerId>) -> Self {
        Self::Ringing {
            started_by: initiator,
            started_at: Utc::now(),
            declined_by: HashSet::new(),
            targets,
        }
    }

    /// Apply an event to derive new state
    pub fn apply(self, event: &CallEventType) -> Result<Self, CallStateError> {
        match (self, event) {
            // Ringing -> Active when a target joins
            (
                Self::Ringing {
                    started_at,
                    started_by,
                    targets,
                    declined_by,
                },
                CallEventType::Joined { peer_id },
            ) => {
                if !targets.contains(peer_id) {
                    return Err(CallStateError::NotInvited(*peer_id));
                }
                let mut participants = HashSet::new();
                participants.insert(started_by);
                participants.insert(*peer_id);
                let invited = targets.difference(&declined_by).copied().collect();
                Ok(Self::Active {
                    started_at,
                    participants,
                    invited,
                })
            }

            // Ringing -> Ringing with decline recorded
            (
                Self::Ringing {
                    started_by,
                    started_at,
                    mut declined_by,
                    targets,
                },
                CallEventType::Declined { peer_id },
            ) => {
                if !targets.contains(peer_id) {
                    return Err(CallStateError::NotInvited(*peer_id));
                }
                declined_by.insert(*peer_id);
                if declined_by.len() >= targets.len() {
                    Ok(Self::Ended {
                        reason: CallEndReason::AllDeclined,
                        duration_secs: None,
                        ended_at: Utc::now(),
                    })
                } else {
                    Ok(Self::Ringing {
                        started_by,
                        started_at,
                        declined_by,
                        targets,
                    })
                }
            }

            // Ringing -> Ended when initiator cancels or nobody answers
            (Self::Ringing { .. }, CallEventType::Ended { reason }) => Ok(Self::Ended {
                reason: *reason,
                duration_secs: None,
                ended_at: Utc::now(),
            }),

            // Active -> Active with new participant
            (
                Self::Active {
                    started_at,
                    mut participants,
                    invited,
                },
                CallEventType::Joined { peer_id },
            ) => {
                if !invited.contains(peer_id) && !participants.contains(peer_id) {
                    return Err(CallStateError::NotInvited(*peer_id));
                }
                participants.insert(*peer_id);
                Ok(Self::Active {
                    started_at,
                    participants,
                    invited,
                })
            }

            // Active -> Active with invitation withdrawn
            (
                Self::Active {
                    started_at,
                    participants,
                    mut invited,
                },
                CallEventType::Declined { peer_id },
            ) => {
                invited.remove(peer_id);
                Ok(Self::Active {
                    started_at,
                    participants,
                    invited,
                })
            }

            // Active -> Active or Ended when someone leaves
            (
                Self::Active {
                    started_at,
                    mut participants,
                    invited,
                },
                CallEventType::Left { peer_id },
            ) => {
                if !participants.remove(peer_id) {
                    return Err(CallStateError::NotParticipant(*peer_id));
                }
                // A call of one is over.
                if participants.len() <= 1 {
                    Ok(Self::Ended {
                        reason: CallEndReason::LastLeft,
                        duration_secs: Some(elapsed_secs(started_at)),
                        ended_at: Utc::now(),
                    })
                } else {
                    Ok(Self::Active {
                        started_at,
                        participants,
                        invited,
                    })
                }
            }

            // Active -> Ended
            (Self::Active { started_at, .. }, CallEventType::Ended { reason }) => Ok(Self::Ended {
                reason: *reason,
                duration_secs: Some(elapsed_secs(started_at)),
                ended_at: Utc::now(),
            }),

            // Ended state is terminal
            (Self::Ended { .. }, _) => Err(CallStateError::CallAlreadyEnded),

            // Invalid transitions
            (state, event) => Err(CallStateError::InvalidTransition {
                state: format!("{state:?}"),
                event: format!("{event:?}"),
            }),
        }
    }

    /// Check if call is still active (not ended)
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Ended { .. })
    }

    pub const fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Get participants if call is active
    pub const fn participants(&self) -> Option<&HashSet<PeerId>> {
        match self {
            Self::Active { participants, .. } => Some(participants),
            _ => None,
        }
    }

    /// Whether `peer_id` belongs to the call in any role.
    pub fn involves(&self, peer_id: PeerId) -> bool {
        match self {
            Self::Ringing {
                started_by,
                targets,
                ..
            } => *started_by == peer_id || targets.contains(&peer_id),
            Self::Active {
                participants,
                invited,
                ..
            } => participants.contains(&peer_id) || invited.contains(&peer_id),
            Self::Ended { .. } => false,
        }
    }

    /// Everyone who should hear about the call's events.
    pub fn audience(&self) -> HashSet<PeerId> {
        match self {
            Self::Ringing {
                started_by,
                targets,
                ..
            } => targets.iter().copied().chain([*started_by]).collect(),
            Self::Active {
                participants,
                invited,
                ..
            } => participants.union(invited).copied().collect(),
            Self::Ended { .. } => HashSet::new(),
        }
    }
}

/// Errors for call state transitions
#[derive(Debug, thiserror::Error)]
pub enum CallStateError {
    #[error("Call has already ended")]
    CallAlreadyEnded,
    #[error("Peer {0} was not invited to the call")]
    NotInvited(PeerId),
    #[error("Peer {0} is not in the call")]
    NotParticipant(PeerId),
    #[error("Invalid state transition: {state} + {event}")]
    InvalidTransition { state: String, event: String },
}
