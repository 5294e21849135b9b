//! Per-peer membership state

use crate::types::{now, NodeId};
use serde::{Deserialize, Serialize};

// Flag bits on a cache entry.

/// Node is managed through the configuration, not the message bus.
pub const FLAG_REMOTE: u32 = 0x0001;
/// Entry is stale and eligible for the next reap sweep.
pub const FLAG_DIRTY: u32 = 0x0002;

/// Liveness as reported by the process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Member,
    Lost,
}

/// Progress of a node through the leader's join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JoinPhase {
    Nack,
    None,
    Welcomed,
    Integrated,
    Finalized,
    Confirmed,
}

/// Expected state recorded by the leader (e.g. after fencing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedState {
    Member,
    Down,
}

/// One entry in the peer cache.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Stable identifier, unique across the cache.
    pub uuid: String,
    /// Human-readable name, unique across the cache.
    pub uname: String,
    /// Id on the message bus. Remote nodes never have one.
    pub bus_id: Option<NodeId>,
    pub liveness: Liveness,
    pub flags: u32,
    pub join: JoinPhase,
    pub last_seen: u64,
    /// Leader-only: the join phase this node is expected to reach next.
    pub expected_join: Option<JoinPhase>,
    /// Leader-only: expected membership state.
    pub expected: Option<ExpectedState>,
}

impl ClusterNode {
    pub fn new(uuid: String, uname: String, bus_id: Option<NodeId>) -> Self {
        Self {
            uuid,
            uname,
            bus_id,
            liveness: Liveness::Lost,
            flags: 0,
            join: JoinPhase::None,
            last_seen: now(),
            expected_join: None,
            expected: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.flags & FLAG_REMOTE != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    pub fn is_member(&self) -> bool {
        self.liveness == Liveness::Member
    }

    /// Copy fields from an older duplicate entry where this entry is empty.
    /// The older entry is discarded by the caller afterwards.
    pub fn absorb(&mut self, older: &ClusterNode) {
        if self.bus_id.is_none() {
            self.bus_id = older.bus_id;
        }
        if self.uname.is_empty() {
            self.uname = older.uname.clone();
        }
        if self.expected_join.is_none() {
            self.expected_join = older.expected_join;
        }
        if self.expected.is_none() {
            self.expected = older.expected;
        }
        self.flags |= older.flags;
        self.last_seen = self.last_seen.max(older.last_seen);
    }
}
