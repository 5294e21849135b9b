//! Transition graphs: synapses gating actions
//!
//! A graph is a set of synapses, each an AND of input actions gating an AND
//! of output actions. The policy engine computes the graph; this module
//! only validates and tracks execution state.

use crate::executor::op::RscDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub type ActionId = u32;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate action id {0}")]
    DuplicateAction(ActionId),
    #[error("synapse {synapse} references unknown action {action}")]
    UnknownAction { synapse: u32, action: ActionId },
    #[error("graph contains a dependency cycle")]
    Cycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Run through a node's executor interface.
    Resource,
    /// Internal ordering point; no I/O.
    Pseudo,
    /// Multicast to peers (e.g. a shutdown request).
    Cluster,
    /// Handed to the fencing coordinator.
    Fencing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionStatus {
    #[default]
    Waiting,
    InFlight,
    Confirmed,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Confirmed | ActionStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    /// Node the action applies to; `None` for pure ordering points.
    pub target: Option<String>,
    pub task: String,
    pub timeout_ms: u64,
    /// Rc that counts as success for this action.
    pub target_rc: i32,
    /// Resource identity for resource ops.
    pub rsc: Option<RscDefinition>,
    pub interval_ms: u64,
    pub params: BTreeMap<String, String>,
    /// Cluster ops only: deadline expiry confirms instead of failing.
    #[serde(default)]
    pub confirm_on_expiry: bool,
    #[serde(skip)]
    pub status: ActionStatus,
    /// Epoch-ms deadline armed at dispatch.
    #[serde(skip)]
    pub deadline: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynapseState {
    #[default]
    Pending,
    Ready,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synapse {
    pub id: u32,
    pub priority: i32,
    /// Actions that must be confirmed before the outputs fire.
    pub inputs: Vec<ActionId>,
    pub outputs: Vec<ActionId>,
    /// A failed input still satisfies this synapse.
    #[serde(default)]
    pub tolerate_input_failure: bool,
    #[serde(skip)]
    pub state: SynapseState,
    /// Confirmed-with-failure.
    #[serde(skip)]
    pub failed: bool,
}

/// The policy engine's wire form of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub actions: Vec<Action>,
    pub synapses: Vec<Synapse>,
    /// 0 means "use the configured default".
    #[serde(default)]
    pub batch_limit: u32,
}

pub struct Graph {
    pub id: u64,
    pub batch_limit: u32,
    actions: HashMap<ActionId, Action>,
    synapses: Vec<Synapse>,
}

impl Graph {
    /// Validate and instantiate a graph: action ids unique, every synapse
    /// reference resolvable, no dependency cycle between synapses.
    pub fn new(id: u64, spec: GraphSpec, default_batch_limit: u32) -> Result<Self, GraphError> {
        let mut actions = HashMap::with_capacity(spec.actions.len());
        for action in spec.actions {
            let id = action.id;
            if actions.insert(id, action).is_some() {
                return Err(GraphError::DuplicateAction(id));
            }
        }
        for synapse in &spec.synapses {
            for id in synapse.inputs.iter().chain(synapse.outputs.iter()) {
                if !actions.contains_key(id) {
                    return Err(GraphError::UnknownAction {
                        synapse: synapse.id,
                        action: *id,
                    });
                }
            }
        }

        // Cycle check over the synapse dependency relation: A depends on B
        // when one of A's inputs is one of B's outputs.
        let producer: HashMap<ActionId, usize> = spec
            .synapses
            .iter()
            .enumerate()
            .flat_map(|(i, s)| s.outputs.iter().map(move |a| (*a, i)))
            .collect();
        let mut indegree = vec![0usize; spec.synapses.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); spec.synapses.len()];
        for (i, synapse) in spec.synapses.iter().enumerate() {
            for input in &synapse.inputs {
                if let Some(&p) = producer.get(input) {
                    if p != i {
                        indegree[i] += 1;
                        dependents[p].push(i);
                    } else {
                        return Err(GraphError::Cycle);
                    }
                }
            }
        }
        let mut queue: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0;
        while let Some(i) = queue.pop() {
            visited += 1;
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    queue.push(d);
                }
            }
        }
        if visited != spec.synapses.len() {
            return Err(GraphError::Cycle);
        }

        let batch_limit = if spec.batch_limit == 0 {
            default_batch_limit
        } else {
            spec.batch_limit
        };
        Ok(Self {
            id,
            batch_limit,
            actions,
            synapses: spec.synapses,
        })
    }

    pub fn action(&self, id: ActionId) -> Option<&Action> {
        self.actions.get(&id)
    }

    pub fn action_mut(&mut self, id: ActionId) -> Option<&mut Action> {
        self.actions.get_mut(&id)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.values()
    }

    pub fn actions_mut(&mut self) -> impl Iterator<Item = &mut Action> {
        self.actions.values_mut()
    }

    pub fn synapses(&self) -> &[Synapse] {
        &self.synapses
    }

    /// Propagate action state into synapse state until a fixpoint:
    /// pending synapses become ready (all inputs satisfied) or skip
    /// (non-tolerated input failure, outputs marked failed); ready
    /// synapses with all outputs terminal confirm.
    pub fn refresh(&mut self) {
        loop {
            let mut changed = false;
            for i in 0..self.synapses.len() {
                match self.synapses[i].state {
                    SynapseState::Pending => {
                        let tolerate = self.synapses[i].tolerate_input_failure;
                        let inputs = self.synapses[i].inputs.clone();
                        let input_status: Vec<ActionStatus> = inputs
                            .iter()
                            .map(|id| self.actions.get(id).map(|a| a.status).unwrap_or_default())
                            .collect();
                        let any_failed = input_status.contains(&ActionStatus::Failed);
                        if any_failed && !tolerate {
                            self.synapses[i].state = SynapseState::Confirmed;
                            self.synapses[i].failed = true;
                            let outputs = self.synapses[i].outputs.clone();
                            for id in outputs {
                                if let Some(action) = self.actions.get_mut(&id) {
                                    if action.status == ActionStatus::Waiting {
                                        action.status = ActionStatus::Failed;
                                    }
                                }
                            }
                            changed = true;
                        } else if input_status.iter().all(|s| s.is_terminal()) {
                            self.synapses[i].state = SynapseState::Ready;
                            changed = true;
                        }
                    }
                    SynapseState::Ready => {
                        let done = self.synapses[i].outputs.iter().all(|id| {
                            self.actions
                                .get(id)
                                .map(|a| a.status.is_terminal())
                                .unwrap_or(true)
                        });
                        if done {
                            let failed = self.synapses[i].outputs.iter().any(|id| {
                                self.actions
                                    .get(id)
                                    .map(|a| a.status == ActionStatus::Failed)
                                    .unwrap_or(false)
                            });
                            self.synapses[i].state = SynapseState::Confirmed;
                            self.synapses[i].failed = failed;
                            changed = true;
                        }
                    }
                    SynapseState::Confirmed => {}
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Output actions of ready synapses still waiting to fire, ordered by
    /// synapse priority (highest first).
    pub fn fireable(&self) -> Vec<ActionId> {
        let mut ready: Vec<&Synapse> = self
            .synapses
            .iter()
            .filter(|s| s.state == SynapseState::Ready)
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
            .iter()
            .flat_map(|s| s.outputs.iter())
            .filter(|id| {
                self.actions
                    .get(id)
                    .map(|a| a.status == ActionStatus::Waiting)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    pub fn complete(&self) -> bool {
        self.synapses
            .iter()
            .all(|s| s.state == SynapseState::Confirmed)
    }

    pub fn has_failures(&self) -> bool {
        self.synapses.iter().any(|s| s.failed)
    }
}

/// Convenience constructors used across the engine and its tests.
impl Action {
    pub fn pseudo(id: ActionId, task: &str) -> Self {
        Self {
            id,
            kind: ActionKind::Pseudo,
            target: None,
            task: task.to_string(),
            timeout_ms: 0,
            target_rc: 0,
            rsc: None,
            interval_ms: 0,
            params: BTreeMap::new(),
            confirm_on_expiry: false,
            status: ActionStatus::Waiting,
            deadline: None,
        }
    }

    pub fn resource(
        id: ActionId,
        target: &str,
        task: &str,
        rsc: RscDefinition,
        target_rc: i32,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            kind: ActionKind::Resource,
            target: Some(target.to_string()),
            task: task.to_string(),
            timeout_ms,
            target_rc,
            rsc: Some(rsc),
            interval_ms: 0,
            params: BTreeMap::new(),
            confirm_on_expiry: false,
            status: ActionStatus::Waiting,
            deadline: None,
        }
    }

    pub fn fencing(id: ActionId, target: &str, task: &str, timeout_ms: u64) -> Self {
        Self {
            id,
            kind: ActionKind::Fencing,
            target: Some(target.to_string()),
            task: task.to_string(),
            timeout_ms,
            target_rc: 0,
            rsc: None,
            interval_ms: 0,
            params: BTreeMap::new(),
            confirm_on_expiry: false,
            status: ActionStatus::Waiting,
            deadline: None,
        }
    }

    pub fn cluster(id: ActionId, target: &str, task: &str, timeout_ms: u64) -> Self {
        Self {
            id,
            kind: ActionKind::Cluster,
            target: Some(target.to_string()),
            task: task.to_string(),
            timeout_ms,
            target_rc: 0,
            rsc: None,
            interval_ms: 0,
            params: BTreeMap::new(),
            confirm_on_expiry: false,
            status: ActionStatus::Waiting,
            deadline: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synapse(id: u32, inputs: Vec<ActionId>, outputs: Vec<ActionId>) -> Synapse {
        Synapse {
            id,
            priority: 0,
            inputs,
            outputs,
            tolerate_input_failure: false,
            state: SynapseState::Pending,
            failed: false,
        }
    }

    #[test]
    fn test_validation_rejects_unknown_reference() {
        let spec = GraphSpec {
            actions: vec![Action::pseudo(1, "stage")],
            synapses: vec![synapse(0, vec![99], vec![1])],
            batch_limit: 0,
        };
        assert!(matches!(
            Graph::new(1, spec, 30),
            Err(GraphError::UnknownAction { action: 99, .. })
        ));
    }

    #[test]
    fn test_validation_rejects_cycle() {
        let spec = GraphSpec {
            actions: vec![Action::pseudo(1, "a"), Action::pseudo(2, "b")],
            synapses: vec![synapse(0, vec![2], vec![1]), synapse(1, vec![1], vec![2])],
            batch_limit: 0,
        };
        assert!(matches!(Graph::new(1, spec, 30), Err(GraphError::Cycle)));
    }

    #[test]
    fn test_validation_rejects_duplicate_action() {
        let spec = GraphSpec {
            actions: vec![Action::pseudo(1, "a"), Action::pseudo(1, "b")],
            synapses: vec![],
            batch_limit: 0,
        };
        assert!(matches!(
            Graph::new(1, spec, 30),
            Err(GraphError::DuplicateAction(1))
        ));
    }

    #[test]
    fn test_empty_inputs_ready_immediately() {
        let spec = GraphSpec {
            actions: vec![Action::pseudo(1, "go")],
            synapses: vec![synapse(0, vec![], vec![1])],
            batch_limit: 0,
        };
        let mut graph = Graph::new(1, spec, 30).unwrap();
        graph.refresh();
        assert_eq!(graph.fireable(), vec![1]);
    }

    #[test]
    fn test_failed_input_skips_outputs() {
        let spec = GraphSpec {
            actions: vec![Action::pseudo(1, "first"), Action::pseudo(2, "second")],
            synapses: vec![synapse(0, vec![], vec![1]), synapse(1, vec![1], vec![2])],
            batch_limit: 0,
        };
        let mut graph = Graph::new(1, spec, 30).unwrap();
        graph.refresh();
        graph.action_mut(1).unwrap().status = ActionStatus::Failed;
        graph.refresh();

        assert_eq!(graph.action(2).unwrap().status, ActionStatus::Failed);
        assert!(graph.complete());
        assert!(graph.has_failures());
    }

    #[test]
    fn test_tolerated_failure_still_fires() {
        let mut tolerant = synapse(1, vec![1], vec![2]);
        tolerant.tolerate_input_failure = true;
        let spec = GraphSpec {
            actions: vec![Action::pseudo(1, "first"), Action::pseudo(2, "second")],
            synapses: vec![synapse(0, vec![], vec![1]), tolerant],
            batch_limit: 0,
        };
        let mut graph = Graph::new(1, spec, 30).unwrap();
        graph.refresh();
        graph.action_mut(1).unwrap().status = ActionStatus::Failed;
        graph.refresh();

        assert_eq!(graph.fireable(), vec![2]);
    }

    #[test]
    fn test_priority_orders_fireable() {
        let mut high = synapse(0, vec![], vec![1]);
        high.priority = 10;
        let mut low = synapse(1, vec![], vec![2]);
        low.priority = 1;
        let spec = GraphSpec {
            actions: vec![Action::pseudo(1, "a"), Action::pseudo(2, "b")],
            synapses: vec![low, high],
            batch_limit: 0,
        };
        let mut graph = Graph::new(1, spec, 30).unwrap();
        graph.refresh();
        assert_eq!(graph.fireable(), vec![1, 2]);
    }
}
