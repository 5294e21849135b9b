//! Graph execution: dispatch, event matching, abort protocol

use super::graph::{ActionId, ActionKind, ActionStatus, Graph, GraphError, GraphSpec};
use crate::executor::op::{ExecRequest, OpResult, TransitionKey};
use crate::fencing::command::FenceCommand;
use crate::fencing::FenceOutcome;
use crate::messaging::ClusterMsg;
use crate::types::{now_ms, ControllerState, Origin};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Score treated as unbeatable in abort-priority comparisons.
pub const INFINITY: i32 = 1_000_000;

/// What to do about the current graph once the abort lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortAction {
    /// Discard the graph on the next trigger and recompute.
    Restart,
    /// Stop dispatching new actions, let in-flight ones finish.
    Cancel,
    /// Finish the graph, then recompute.
    Recompute,
}

#[derive(Debug, Clone)]
pub struct AbortRecord {
    pub priority: i32,
    pub action: AbortAction,
    pub reason: String,
}

/// Caller's obligation after an abort call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortDisposition {
    /// Not the leader; nothing recorded.
    Suppressed,
    /// Recorded against the running graph; re-trigger.
    Recorded,
    /// Graph already complete: recompute after the debounce.
    DebounceRecompute(Duration),
    /// Recompute immediately.
    Recompute,
}

/// One unit of I/O the trigger pass wants performed.
#[derive(Debug)]
pub enum Dispatch {
    Resource { node: String, request: ExecRequest },
    Cluster { msg: ClusterMsg },
    Fencing { cmd: FenceCommand },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphStatus {
    /// No graph loaded.
    Idle,
    Active,
    Complete { failed: bool },
    /// Current graph was discarded; the policy engine must run again.
    NeedsRecompute,
}

#[derive(Debug)]
pub struct TriggerOutcome {
    pub dispatches: Vec<Dispatch>,
    pub status: GraphStatus,
}

/// How an incoming event related to the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Confirmed,
    Failed,
    /// Belongs to a previous graph or another leader.
    Stale,
    /// Action already terminal; event absorbed.
    Duplicate,
    /// No correlation data at all.
    Unmatched,
}

pub struct TransitionEngine {
    dc_uuid: String,
    state: ControllerState,
    graph: Option<Graph>,
    next_graph_id: u64,
    /// Dynamic dispatch ceiling from the load governor.
    throttle: u32,
    abort: Option<AbortRecord>,
    /// Fencing correlation ids -> actions awaiting their broadcast.
    pending_fence: HashMap<u64, ActionId>,
    next_fence_id: u64,
    default_batch_limit: u32,
    recompute_debounce: Duration,
}

impl TransitionEngine {
    pub fn new(dc_uuid: &str, default_batch_limit: u32, recompute_debounce: Duration) -> Self {
        Self {
            dc_uuid: dc_uuid.to_string(),
            state: ControllerState::Starting,
            graph: None,
            next_graph_id: 0,
            throttle: u32::MAX,
            abort: None,
            pending_fence: HashMap::new(),
            next_fence_id: 0,
            default_batch_limit,
            recompute_debounce,
        }
    }

    pub fn set_state(&mut self, state: ControllerState) {
        self.state = state;
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// The load governor advertises how much this node may dispatch per
    /// trigger. Zero stalls dispatch until the next update.
    pub fn set_throttle(&mut self, limit: u32) {
        self.throttle = limit;
    }

    pub fn graph_id(&self) -> Option<u64> {
        self.graph.as_ref().map(|g| g.id)
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    /// Install a freshly computed graph, discarding any in-flight one.
    /// Replacement is itself the abort: the superseded graph is dropped
    /// whole and the abort record resets with it, so the new graph starts
    /// with a clean slate instead of inheriting a stale priority.
    pub fn start_graph(&mut self, spec: GraphSpec) -> Result<u64, GraphError> {
        if let Some(old) = self.graph.take() {
            warn!("Discarding graph {} for a newer one", old.id);
        }
        self.next_graph_id += 1;
        let id = self.next_graph_id;
        let graph = Graph::new(id, spec, self.default_batch_limit)?;
        info!(
            "Graph {} loaded: {} synapses, batch limit {}",
            id,
            graph.synapses().len(),
            graph.batch_limit
        );
        self.graph = Some(graph);
        self.abort = None;
        self.pending_fence.clear();
        Ok(id)
    }

    /// Record an abort. Priority only ever climbs; an equal or lower
    /// priority call changes nothing. Aborts while not the leader are
    /// suppressed entirely.
    pub fn abort(&mut self, priority: i32, action: AbortAction, reason: &str) -> AbortDisposition {
        if !self.state.is_leader() {
            debug!(
                "Suppressing abort ({}) in state {:?}",
                reason, self.state
            );
            return AbortDisposition::Suppressed;
        }

        let superseded = self
            .abort
            .as_ref()
            .is_none_or(|existing| priority > existing.priority);
        if superseded {
            info!("Transition abort (priority {}): {}", priority, reason);
            self.abort = Some(AbortRecord {
                priority,
                action,
                reason: reason.to_string(),
            });
        } else {
            debug!("Abort ({}) below current priority; keeping earlier record", reason);
        }

        match &self.graph {
            None => AbortDisposition::Recompute,
            Some(graph) if graph.complete() => {
                if self.recompute_debounce.is_zero() {
                    AbortDisposition::Recompute
                } else {
                    AbortDisposition::DebounceRecompute(self.recompute_debounce)
                }
            }
            Some(_) => AbortDisposition::Recorded,
        }
    }

    fn build_dispatch(&mut self, id: ActionId) -> Option<Dispatch> {
        let graph_id = self.graph.as_ref().map(|g| g.id)?;
        let dc_uuid = self.dc_uuid.clone();
        let graph = self.graph.as_mut()?;
        let action = graph.action_mut(id)?;

        action.status = ActionStatus::InFlight;
        action.deadline = Some(now_ms() + action.timeout_ms.max(1));

        match action.kind {
            ActionKind::Pseudo => None,
            ActionKind::Resource => {
                let node = action.target.clone()?;
                let rsc = action.rsc.clone()?;
                let request = ExecRequest {
                    rsc,
                    task: action.task.clone(),
                    interval_ms: action.interval_ms,
                    timeout_ms: action.timeout_ms,
                    params: action.params.clone(),
                    transition_key: Some(TransitionKey {
                        action_id: action.id,
                        graph_id,
                        target_rc: action.target_rc,
                        dc_uuid,
                    }),
                    lock_time: None,
                };
                Some(Dispatch::Resource { node, request })
            }
            ActionKind::Cluster => {
                let node = action.target.clone()?;
                let msg = match action.task.as_str() {
                    "shutdown" => ClusterMsg::Shutdown { node },
                    other => {
                        warn!("Unknown cluster-wide task {}; treating as recompute", other);
                        ClusterMsg::Recompute {
                            reason: other.to_string(),
                        }
                    }
                };
                Some(Dispatch::Cluster { msg })
            }
            ActionKind::Fencing => {
                let victim = action.target.clone()?;
                self.next_fence_id += 1;
                let mut cmd = FenceCommand::new(
                    &action.task,
                    Some(&victim),
                    action.timeout_ms,
                    Origin::Peer(self.dc_uuid.clone()),
                    self.next_fence_id,
                );
                cmd.fallback = Vec::new();
                self.pending_fence.insert(cmd.id, id);
                Some(Dispatch::Fencing { cmd })
            }
        }
    }

    /// Execute one trigger pass: honor a pending restart abort, then fire
    /// output actions of ready synapses up to the batch limit.
    pub fn trigger(&mut self) -> TriggerOutcome {
        if let Some(abort) = &self.abort {
            if abort.action == AbortAction::Restart {
                if let Some(graph) = self.graph.take() {
                    info!("Discarding graph {}: {}", graph.id, abort.reason);
                }
                self.abort = None;
                self.pending_fence.clear();
                return TriggerOutcome {
                    dispatches: Vec::new(),
                    status: GraphStatus::NeedsRecompute,
                };
            }
        }

        let Some(graph) = self.graph.as_mut() else {
            return TriggerOutcome {
                dispatches: Vec::new(),
                status: GraphStatus::Idle,
            };
        };

        let suppress_new = self
            .abort
            .as_ref()
            .is_some_and(|a| a.action == AbortAction::Cancel);
        let limit = graph.batch_limit.min(self.throttle) as usize;
        let mut dispatches = Vec::new();
        let mut fired = 0usize;

        loop {
            let Some(graph) = self.graph.as_mut() else {
                break;
            };
            graph.refresh();
            if suppress_new {
                break;
            }
            let fireable = graph.fireable();
            if fireable.is_empty() {
                break;
            }

            let mut progressed = false;
            for id in fireable {
                let Some(graph) = self.graph.as_mut() else {
                    break;
                };
                let Some(action) = graph.action_mut(id) else {
                    continue;
                };
                if action.status != ActionStatus::Waiting {
                    continue;
                }
                if action.kind == ActionKind::Pseudo {
                    action.status = ActionStatus::Confirmed;
                    progressed = true;
                    continue;
                }
                if fired >= limit {
                    continue;
                }
                match self.build_dispatch(id) {
                    Some(dispatch) => {
                        dispatches.push(dispatch);
                        fired += 1;
                        progressed = true;
                    }
                    None => {
                        // Undispatchable (missing target or resource):
                        // definitive failure, not a hang.
                        if let Some(graph) = self.graph.as_mut() {
                            if let Some(action) = graph.action_mut(id) {
                                warn!("Action {} ({}) is undispatchable", id, action.task);
                                action.status = ActionStatus::Failed;
                            }
                        }
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        let status = match self.graph.as_mut() {
            None => GraphStatus::Idle,
            Some(graph) => {
                graph.refresh();
                if graph.complete() {
                    GraphStatus::Complete {
                        failed: graph.has_failures(),
                    }
                } else {
                    GraphStatus::Active
                }
            }
        };
        TriggerOutcome { dispatches, status }
    }

    /// Match an operation result against the graph by its transition key.
    pub fn handle_op_result(&mut self, result: &OpResult) -> MatchOutcome {
        let Some(magic) = &result.magic else {
            return MatchOutcome::Unmatched;
        };
        let Some(graph) = self.graph.as_mut() else {
            return MatchOutcome::Stale;
        };
        if magic.key.graph_id != graph.id || magic.key.dc_uuid != self.dc_uuid {
            debug!(
                "Stale result for graph {} (current {})",
                magic.key.graph_id, graph.id
            );
            return MatchOutcome::Stale;
        }
        let Some(action) = graph.action_mut(magic.key.action_id) else {
            warn!("Result names unknown action {}", magic.key.action_id);
            return MatchOutcome::Unmatched;
        };
        if action.status.is_terminal() {
            return MatchOutcome::Duplicate;
        }

        if result.rc == magic.key.target_rc && result.status.is_success() {
            action.status = ActionStatus::Confirmed;
            action.deadline = None;
            MatchOutcome::Confirmed
        } else {
            warn!(
                "Action {} ({} on {:?}) failed: rc {} wanted {}",
                action.id, action.task, action.target, result.rc, magic.key.target_rc
            );
            action.status = ActionStatus::Failed;
            action.deadline = None;
            MatchOutcome::Failed
        }
    }

    /// A fencing broadcast confirms (or fails) the action that asked for it.
    pub fn handle_fence_outcome(&mut self, outcome: &FenceOutcome) -> MatchOutcome {
        let Some(action_id) = self.pending_fence.remove(&outcome.id) else {
            return MatchOutcome::Stale;
        };
        let Some(graph) = self.graph.as_mut() else {
            return MatchOutcome::Stale;
        };
        let Some(action) = graph.action_mut(action_id) else {
            return MatchOutcome::Unmatched;
        };
        if action.status.is_terminal() {
            return MatchOutcome::Duplicate;
        }
        if outcome.succeeded() {
            action.status = ActionStatus::Confirmed;
            MatchOutcome::Confirmed
        } else {
            action.status = ActionStatus::Failed;
            MatchOutcome::Failed
        }
    }

    /// A peer acknowledged a cluster-wide op targeted at it.
    pub fn handle_cluster_ack(&mut self, node: &str) -> MatchOutcome {
        let Some(graph) = self.graph.as_mut() else {
            return MatchOutcome::Stale;
        };
        let action = graph.actions_mut().find(|a| {
            a.kind == ActionKind::Cluster
                && a.status == ActionStatus::InFlight
                && a.target.as_deref() == Some(node)
        });
        match action {
            Some(action) => {
                action.status = ActionStatus::Confirmed;
                action.deadline = None;
                MatchOutcome::Confirmed
            }
            None => MatchOutcome::Unmatched,
        }
    }

    /// Expire in-flight actions past their deadline. Timeout is failure,
    /// except cluster ops flagged to confirm optimistically on expiry.
    pub fn expire_deadlines(&mut self) -> Vec<ActionId> {
        let now = now_ms();
        let mut expired = Vec::new();
        let Some(graph) = self.graph.as_mut() else {
            return expired;
        };
        for action in graph.actions_mut() {
            if action.status != ActionStatus::InFlight {
                continue;
            }
            let Some(deadline) = action.deadline else {
                continue;
            };
            if now < deadline {
                continue;
            }
            if action.kind == ActionKind::Cluster && action.confirm_on_expiry {
                action.status = ActionStatus::Confirmed;
            } else {
                warn!("Action {} ({}) timed out", action.id, action.task);
                action.status = ActionStatus::Failed;
            }
            action.deadline = None;
            expired.push(action.id);
        }
        expired
    }

    /// The fencing daemon's connection dropped: every unconfirmed fencing
    /// action fails and the whole graph restarts at infinite priority.
    pub fn fencer_connection_lost(&mut self) -> AbortDisposition {
        let mut failed = 0;
        if let Some(graph) = self.graph.as_mut() {
            for action in graph.actions_mut() {
                if action.kind == ActionKind::Fencing && !action.status.is_terminal() {
                    action.status = ActionStatus::Failed;
                    failed += 1;
                }
            }
        }
        self.pending_fence.clear();
        if failed > 0 {
            warn!("{} fencing actions failed with the fencer connection", failed);
        }
        self.abort(INFINITY, AbortAction::Restart, "fencer connection lost")
    }

    pub fn abort_record(&self) -> Option<&AbortRecord> {
        self.abort.as_ref()
    }
}
