//! Operation identity: keys, transition magic, pending records
//!
//! The transition magic string is the sole key by which result events are
//! matched back to graph actions. Its format is shared by every peer and
//! must round-trip exactly.

use crate::types::OpStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Parameters with this prefix describe the operation, not the resource
/// instance; they are excluded from stop-parameter capture and digests.
pub const META_PREFIX: &str = "meta_";

#[derive(Debug, Error)]
pub enum OpKeyError {
    #[error("malformed operation key: {0}")]
    Malformed(String),
    #[error("malformed transition magic: {0}")]
    BadMagic(String),
    #[error("resource id {0} contains the reserved separator '_'")]
    ReservedSeparator(String),
}

/// Resource ids become the leading segment of operation keys; an embedded
/// separator would make the reverse parse ambiguous.
pub fn validate_rsc_id(id: &str) -> Result<(), OpKeyError> {
    if id.is_empty() || id.contains('_') {
        return Err(OpKeyError::ReservedSeparator(id.to_string()));
    }
    Ok(())
}

/// Canonical operation identifier: `<resource>_<task>_<interval-ms>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpKey {
    pub rsc: String,
    pub task: String,
    pub interval_ms: u64,
}

impl OpKey {
    pub fn new(rsc: &str, task: &str, interval_ms: u64) -> Self {
        Self {
            rsc: rsc.to_string(),
            task: task.to_string(),
            interval_ms,
        }
    }

    pub fn parse(key: &str) -> Result<Self, OpKeyError> {
        let (rsc, rest) = key
            .split_once('_')
            .ok_or_else(|| OpKeyError::Malformed(key.to_string()))?;
        // Tasks may themselves contain '_' (migrate_to); the interval is
        // always the final segment.
        let (task, interval) = rest
            .rsplit_once('_')
            .ok_or_else(|| OpKeyError::Malformed(key.to_string()))?;
        if rsc.is_empty() || task.is_empty() {
            return Err(OpKeyError::Malformed(key.to_string()));
        }
        let interval_ms: u64 = interval
            .parse()
            .map_err(|_| OpKeyError::Malformed(key.to_string()))?;
        Ok(Self::new(rsc, task, interval_ms))
    }

    pub fn is_recurring(&self) -> bool {
        self.interval_ms > 0
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.rsc, self.task, self.interval_ms)
    }
}

/// The graph coordinates embedded in every recorded operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionKey {
    pub action_id: u32,
    pub graph_id: u64,
    pub target_rc: i32,
    pub dc_uuid: String,
}

impl fmt::Display for TransitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.action_id, self.graph_id, self.target_rc, self.dc_uuid
        )
    }
}

impl TransitionKey {
    pub fn parse(s: &str) -> Result<Self, OpKeyError> {
        let mut parts = s.splitn(4, ':');
        let action_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| OpKeyError::BadMagic(s.to_string()))?;
        let graph_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| OpKeyError::BadMagic(s.to_string()))?;
        let target_rc = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| OpKeyError::BadMagic(s.to_string()))?;
        let dc_uuid = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| OpKeyError::BadMagic(s.to_string()))?
            .to_string();
        Ok(Self {
            action_id,
            graph_id,
            target_rc,
            dc_uuid,
        })
    }
}

/// Full result correlation string:
/// `<op-status>:<op-rc>;<action>:<graph>:<target-rc>:<dc-uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMagic {
    pub op_status: i32,
    pub op_rc: i32,
    pub key: TransitionKey,
}

impl fmt::Display for TransitionMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{};{}", self.op_status, self.op_rc, self.key)
    }
}

impl TransitionMagic {
    pub fn parse(s: &str) -> Result<Self, OpKeyError> {
        let (status_part, key_part) = s
            .split_once(';')
            .ok_or_else(|| OpKeyError::BadMagic(s.to_string()))?;
        let (status, rc) = status_part
            .split_once(':')
            .ok_or_else(|| OpKeyError::BadMagic(s.to_string()))?;
        let op_status = status
            .parse()
            .map_err(|_| OpKeyError::BadMagic(s.to_string()))?;
        let op_rc = rc.parse().map_err(|_| OpKeyError::BadMagic(s.to_string()))?;
        Ok(Self {
            op_status,
            op_rc,
            key: TransitionKey::parse(key_part)?,
        })
    }
}

/// Static identity of a resource agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RscDefinition {
    pub id: String,
    pub class: String,
    pub provider: Option<String>,
    pub ty: String,
}

/// A request handed to an executor connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub rsc: RscDefinition,
    pub task: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub params: BTreeMap<String, String>,
    pub transition_key: Option<TransitionKey>,
    /// Shutdown-lock stamp to carry into the history update on success.
    pub lock_time: Option<u64>,
}

impl ExecRequest {
    pub fn key(&self) -> OpKey {
        OpKey::new(&self.rsc.id, &self.task, self.interval_ms)
    }
}

/// A completed (or synthesized) operation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub rsc: String,
    pub task: String,
    pub interval_ms: u64,
    pub call_id: i64,
    pub rc: i32,
    pub status: OpStatus,
    pub magic: Option<TransitionMagic>,
    /// Parameters the operation actually ran with.
    pub params: BTreeMap<String, String>,
    pub exec_time_ms: u64,
    pub finished_at: u64,
    /// Fabricated locally, never seen by an executor.
    pub synthetic: bool,
    /// The resource was deleted out from under the operation.
    pub deleted: bool,
    /// Shutdown-lock stamp to preserve on success.
    pub lock_time: Option<u64>,
}

impl OpResult {
    pub fn key(&self) -> OpKey {
        OpKey::new(&self.rsc, &self.task, self.interval_ms)
    }

    pub fn is_recurring(&self) -> bool {
        self.interval_ms > 0
    }
}

/// One in-flight operation tracked by the per-node interface.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub call_id: i64,
    pub key: OpKey,
    pub started_at: u64,
    pub transition_key: Option<TransitionKey>,
    pub lock_time: Option<u64>,
    pub remove_on_complete: bool,
    pub cancelled: bool,
    pub synthetic: bool,
}

/// Pending operations keyed by call id. Synthetic results are assigned ids
/// from a disjoint negative namespace and routed on the `synthetic` flag,
/// never on magnitude.
#[derive(Default)]
pub struct PendingTable {
    by_call: std::collections::HashMap<i64, PendingOp>,
    next_synthetic: i64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            by_call: std::collections::HashMap::new(),
            next_synthetic: 0,
        }
    }

    pub fn next_synthetic_id(&mut self) -> i64 {
        self.next_synthetic -= 1;
        self.next_synthetic
    }

    pub fn insert(&mut self, op: PendingOp) {
        self.by_call.insert(op.call_id, op);
    }

    pub fn get(&self, call_id: i64) -> Option<&PendingOp> {
        self.by_call.get(&call_id)
    }

    pub fn get_mut(&mut self, call_id: i64) -> Option<&mut PendingOp> {
        self.by_call.get_mut(&call_id)
    }

    pub fn remove(&mut self, call_id: i64) -> Option<PendingOp> {
        self.by_call.remove(&call_id)
    }

    pub fn find_by_key(&self, key: &OpKey) -> Option<&PendingOp> {
        self.by_call.values().find(|op| &op.key == key)
    }

    pub fn find_by_key_mut(&mut self, key: &OpKey) -> Option<&mut PendingOp> {
        self.by_call.values_mut().find(|op| &op.key == key)
    }

    pub fn remove_for_resource(&mut self, rsc: &str) -> usize {
        let doomed: Vec<i64> = self
            .by_call
            .values()
            .filter(|op| op.key.rsc == rsc)
            .map(|op| op.call_id)
            .collect();
        for id in &doomed {
            self.by_call.remove(id);
        }
        doomed.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.by_call.values()
    }

    pub fn len(&self) -> usize {
        self.by_call.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_call.is_empty()
    }
}
