//! Transition engine: graph model and execution

pub mod engine;
pub mod graph;

pub use engine::{
    AbortAction, AbortDisposition, AbortRecord, Dispatch, GraphStatus, MatchOutcome,
    TransitionEngine, TriggerOutcome, INFINITY,
};
pub use graph::{
    Action, ActionId, ActionKind, ActionStatus, Graph, GraphError, GraphSpec, Synapse,
    SynapseState,
};
