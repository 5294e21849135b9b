//! Cluster message payloads

use crate::executor::op::{ExecRequest, OpResult};
use crate::fencing::command::{FenceCommand, FenceOutcome};
use crate::membership::JoinPhase;
use serde::{Deserialize, Serialize};

/// Everything the controller core sends over the cluster bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMsg {
    /// Leader -> node: run a resource operation via that node's executor.
    ExecOp(ExecRequest),
    /// Node -> leader: result of a proxied operation.
    ExecResult(OpResult),
    /// Ask a peer capable of fencing the victim to do so.
    FenceRequest(FenceCommand),
    /// Broadcast after a power action completes; every peer updates its view.
    FenceNotify(FenceOutcome),
    /// Cluster-wide shutdown request for a node.
    Shutdown { node: String },
    ShutdownAck { node: String },
    /// Poke the policy engine: inputs changed, compute a new graph.
    Recompute { reason: String },
    /// Leader's view of a peer's join progress.
    JoinUpdate { node: String, phase: JoinPhase },
}

impl ClusterMsg {
    pub fn command(&self) -> &'static str {
        match self {
            ClusterMsg::ExecOp(_) => "exec-op",
            ClusterMsg::ExecResult(_) => "exec-result",
            ClusterMsg::FenceRequest(_) => "fence-request",
            ClusterMsg::FenceNotify(_) => "fence-notify",
            ClusterMsg::Shutdown { .. } => "shutdown",
            ClusterMsg::ShutdownAck { .. } => "shutdown-ack",
            ClusterMsg::Recompute { .. } => "recompute",
            ClusterMsg::JoinUpdate { .. } => "join-update",
        }
    }
}
