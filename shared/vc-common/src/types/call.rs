//! Mesh call types shared over the wire.

use serde::{Deserialize, Serialize};

/// Reason a mesh call ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// Initiator hung up before anyone joined.
    Cancelled,
    /// Every target declined.
    AllDeclined,
    /// Nobody answered before the ring timeout.
    NoAnswer,
    /// Last participant left.
    LastLeft,
    /// A participant ended the call for everyone.
    HungUp,
}
