//! End-to-end transition scenarios against the real local executor
//!
//! Run with: cargo test --test transition_test

use regent::cib::{CibClient, CibRequest};
use regent::executor::{
    AgentRoots, ExecutorConn, LocalExecutor, NodeExecutor, OpResult, RscDefinition,
};
use regent::transition::{
    AbortAction, Action, ActionId, Dispatch, GraphSpec, GraphStatus, Synapse, SynapseState,
    TransitionEngine,
};
use regent::types::ControllerState;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

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

fn dummy() -> RscDefinition {
    // stonith class resolves to <root>/<ty>; /bin/true always succeeds.
    RscDefinition {
        id: "r1".to_string(),
        class: "stonith".to_string(),
        provider: None,
        ty: "true".to_string(),
    }
}

fn node_executor() -> (NodeExecutor, mpsc::UnboundedReceiver<OpResult>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let roots = AgentRoots {
        ocf: PathBuf::from("/bin"),
        stonith: PathBuf::from("/bin"),
    };
    let mut local = LocalExecutor::new("n1", tx.clone(), roots);
    local.connect().unwrap();
    (NodeExecutor::new(ExecutorConn::Local(local), tx), rx)
}

fn leader_engine() -> TransitionEngine {
    let mut engine = TransitionEngine::new("dc-1", 30, Duration::ZERO);
    engine.set_state(ControllerState::Transition);
    engine
}

/// S1: a start confirms, history captures the instance parameters, the
/// graph completes.
#[tokio::test]
async fn test_successful_start_records_history() {
    let mut engine = leader_engine();
    let (mut executor, mut events) = node_executor();
    let (cib, mut cib_rx) = CibClient::channel();

    let mut start = Action::resource(1, "n1", "start", dummy(), 0, 60_000);
    start.params.insert("port".to_string(), "3306".to_string());
    let spec = GraphSpec {
        actions: vec![start],
        synapses: vec![synapse(0, vec![], vec![1])],
        batch_limit: 0,
    };
    engine.start_graph(spec).unwrap();

    let outcome = engine.trigger();
    assert_eq!(outcome.status, GraphStatus::Active);
    let Dispatch::Resource { node, request } = outcome.dispatches.into_iter().next().unwrap()
    else {
        panic!("expected a resource dispatch");
    };
    assert_eq!(node, "n1");

    executor.dispatch(request).await;
    let result = events.recv().await.unwrap();
    executor.process_result(&result, &cib);
    engine.handle_op_result(&result);

    let outcome = engine.trigger();
    assert_eq!(outcome.status, GraphStatus::Complete { failed: false });

    let entry = executor.history.get("r1").unwrap();
    assert_eq!(entry.last.as_ref().unwrap().task, "start");
    assert_eq!(
        entry.stop_params.get("port").map(String::as_str),
        Some("3306")
    );
    assert!(matches!(
        cib_rx.try_recv().unwrap(),
        CibRequest::UpdateHistory { .. }
    ));
}

/// S5: the stop runs with the parameters captured at start, not the
/// configuration's newest values.
#[tokio::test]
async fn test_parameter_change_across_stop() {
    let (mut executor, mut events) = node_executor();
    let (cib, _cib_rx) = CibClient::channel();

    let mut start = regent::executor::ExecRequest {
        rsc: dummy(),
        task: "start".to_string(),
        interval_ms: 0,
        timeout_ms: 10_000,
        params: Default::default(),
        transition_key: None,
        lock_time: None,
    };
    start.params.insert("port".to_string(), "3306".to_string());
    executor.dispatch(start.clone()).await;
    let result = events.recv().await.unwrap();
    executor.process_result(&result, &cib);

    let mut stop = start;
    stop.task = "stop".to_string();
    stop.params.insert("port".to_string(), "3307".to_string());
    executor.dispatch(stop).await;
    let result = events.recv().await.unwrap();

    assert_eq!(result.task, "stop");
    assert_eq!(result.params.get("port").map(String::as_str), Some("3306"));
}

/// S6: losing the fencing daemon fails the pending fencing action and
/// forces a recompute at infinite priority.
#[tokio::test]
async fn test_fencer_loss_aborts_transition() {
    let mut engine = leader_engine();
    let spec = GraphSpec {
        actions: vec![Action::fencing(7, "n3", "off", 30_000)],
        synapses: vec![synapse(0, vec![], vec![7])],
        batch_limit: 0,
    };
    engine.start_graph(spec).unwrap();
    let outcome = engine.trigger();
    assert!(matches!(outcome.dispatches[0], Dispatch::Fencing { .. }));

    engine.fencer_connection_lost();
    let record = engine.abort_record().unwrap();
    assert_eq!(record.priority, regent::transition::INFINITY);
    assert_eq!(record.action, AbortAction::Restart);

    let outcome = engine.trigger();
    assert_eq!(outcome.status, GraphStatus::NeedsRecompute);
    assert!(!engine.has_graph());
}

/// Lower-priority aborts after a higher one change nothing.
#[tokio::test]
async fn test_abort_is_monotone() {
    let mut engine = leader_engine();
    let spec = GraphSpec {
        actions: vec![Action::resource(1, "n1", "start", dummy(), 0, 60_000)],
        synapses: vec![synapse(0, vec![], vec![1])],
        batch_limit: 0,
    };
    engine.start_graph(spec).unwrap();
    engine.trigger();

    engine.abort(100, AbortAction::Recompute, "p1");
    let after_first = engine.abort_record().unwrap().clone();
    engine.abort(100, AbortAction::Restart, "p2 equal");
    engine.abort(50, AbortAction::Restart, "p2 lower");
    let after_rest = engine.abort_record().unwrap();

    assert_eq!(after_rest.priority, after_first.priority);
    assert_eq!(after_rest.action, after_first.action);
    assert_eq!(after_rest.reason, after_first.reason);
}

/// Once terminal, an action ignores further events.
#[tokio::test]
async fn test_confirmations_are_terminal() {
    let mut engine = leader_engine();
    let (mut executor, mut events) = node_executor();
    let (cib, _cib_rx) = CibClient::channel();

    let spec = GraphSpec {
        actions: vec![Action::resource(1, "n1", "monitor", dummy(), 0, 60_000)],
        synapses: vec![synapse(0, vec![], vec![1])],
        batch_limit: 0,
    };
    engine.start_graph(spec).unwrap();
    let outcome = engine.trigger();
    let Dispatch::Resource { request, .. } = outcome.dispatches.into_iter().next().unwrap()
    else {
        panic!("expected a resource dispatch");
    };

    executor.dispatch(request).await;
    let result = events.recv().await.unwrap();
    executor.process_result(&result, &cib);

    use regent::transition::MatchOutcome;
    assert_eq!(engine.handle_op_result(&result), MatchOutcome::Confirmed);
    assert_eq!(engine.handle_op_result(&result), MatchOutcome::Duplicate);
    assert_eq!(engine.handle_op_result(&result), MatchOutcome::Duplicate);
}
