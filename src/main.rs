//! regentd — leader-side cluster resource manager core
//!
//! Wires the peer cache, transition engine, executor interfaces and fencing
//! coordinator onto one event loop. The policy engine, configuration store
//! and cluster bus are external processes; their seams are channels.

use clap::Parser;
use regent::cib::{CibClient, CibRequest};
use regent::config::CoreConfig;
use regent::executor::{
    AgentRoots, ExecutorConn, LocalExecutor, NodeExecutor, OpResult, PskSource, RemoteExecutor,
};
use regent::fencing::{
    ChildAgentRunner, FenceCoordinator, FenceOutcome, FenceReaction, SELF_FENCE_EXIT,
};
use regent::membership::PeerCache;
use regent::messaging::{seal, ClusterMsg, DaemonKind, HostSpec, Outbox, Sender};
use regent::transition::{AbortAction, Dispatch, GraphStatus, TransitionEngine};
use regent::types::ControllerState;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "regentd", version, about = "Regent cluster resource manager core")]
struct Args {
    /// This node's name
    #[arg(short = 'n', long)]
    node_name: String,

    /// This node's id on the message bus
    #[arg(short = 'i', long, default_value = "0")]
    node_id: u32,

    /// Pre-shared key file for remote executors
    #[arg(long, default_value = "/etc/regent/authkey")]
    psk: PathBuf,

    /// Fallback key file
    #[arg(long, default_value = "/etc/regent/authkey.fallback")]
    psk_fallback: PathBuf,

    /// Remote nodes to manage, comma-separated name=host:port pairs
    #[arg(short = 'r', long)]
    remotes: Option<String>,

    /// Dispatch ceiling per trigger
    #[arg(long, default_value = "30")]
    batch_limit: u32,

    /// Disable automatic reaping of departed peers
    #[arg(long)]
    no_autoreap: bool,
}

struct Controller {
    config: CoreConfig,
    cache: PeerCache,
    engine: TransitionEngine,
    fencing: FenceCoordinator<ChildAgentRunner>,
    executors: HashMap<String, NodeExecutor>,
    outbox: Outbox,
    cib: CibClient,
    exec_tx: mpsc::UnboundedSender<OpResult>,
}

impl Controller {
    fn new(config: CoreConfig, cib: CibClient) -> (Self, mpsc::UnboundedReceiver<OpResult>) {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();

        let mut local = LocalExecutor::new(&config.uname, exec_tx.clone(), AgentRoots::default());
        if let Err(e) = local.connect() {
            warn!("Local executor not ready: {}", e);
        }
        let mut executors = HashMap::new();
        executors.insert(
            config.uname.clone(),
            NodeExecutor::new(ExecutorConn::Local(local), exec_tx.clone()),
        );

        let engine = TransitionEngine::new(
            &config.uuid,
            config.batch_limit,
            Duration::from_millis(config.recompute_debounce_ms),
        );

        let controller = Self {
            cache: PeerCache::new(config.autoreap),
            engine,
            fencing: FenceCoordinator::new(&config.uname, ChildAgentRunner::default()),
            executors,
            outbox: Outbox::new(),
            cib,
            exec_tx,
            config,
        };
        (controller, exec_rx)
    }

    fn add_remote(&mut self, name: &str, addr: &str) {
        let psk = PskSource::new(&self.config.psk_path, &self.config.psk_fallback_path);
        let remote = RemoteExecutor::new(name, addr, psk, self.exec_tx.clone());
        self.executors.insert(
            name.to_string(),
            NodeExecutor::new(ExecutorConn::Remote(remote), self.exec_tx.clone()),
        );
        info!("Tracking remote node {} at {}", name, addr);
    }

    fn sender(&self) -> Sender {
        Sender {
            id: self.config.node_id.unwrap_or(0),
            uname: self.config.uname.clone(),
            pid: std::process::id(),
            kind: DaemonKind::Controller,
        }
    }

    /// Run one trigger pass and perform the I/O it asks for.
    async fn pump_transition(&mut self) {
        let outcome = self.engine.trigger();
        for dispatch in outcome.dispatches {
            match dispatch {
                Dispatch::Resource { node, request } => match self.executors.get_mut(&node) {
                    Some(executor) => {
                        let call_id = executor.dispatch(request).await;
                        debug!("Dispatched to {} as call {}", node, call_id);
                    }
                    None => {
                        warn!("No executor interface for {}", node);
                    }
                },
                Dispatch::Cluster { msg } => {
                    self.broadcast(&msg);
                }
                Dispatch::Fencing { cmd } => {
                    // Suspend reaping so the stonith bookkeeping cannot race
                    // a cache sweep.
                    let was = self.cache.set_autoreap(false);
                    let outcome = self.fencing.execute(cmd).await;
                    self.broadcast(&ClusterMsg::FenceNotify(outcome.clone()));
                    self.apply_fence_outcome(&outcome);
                    self.cache.set_autoreap(was);
                }
            }
        }

        match outcome.status {
            GraphStatus::Complete { failed } => {
                info!("Transition complete (failures: {})", failed);
                self.engine.set_state(ControllerState::Idle);
            }
            GraphStatus::NeedsRecompute => {
                self.broadcast(&ClusterMsg::Recompute {
                    reason: "transition aborted".to_string(),
                });
            }
            GraphStatus::Idle | GraphStatus::Active => {}
        }
    }

    fn apply_fence_outcome(&mut self, outcome: &FenceOutcome) {
        self.engine.handle_fence_outcome(outcome);
        let is_leader = self.engine.state().is_leader();
        match self
            .fencing
            .handle_notify(outcome, &mut self.cache, &self.cib, is_leader)
        {
            FenceReaction::SelfFenced => {
                error!("Self-fence acknowledged; halting");
                // Returning would let a node the cluster counts dead keep
                // voting. Exit hard with the distinctive code.
                std::process::exit(SELF_FENCE_EXIT);
            }
            FenceReaction::Updated | FenceReaction::Ignored => {}
        }
    }

    fn broadcast(&mut self, msg: &ClusterMsg) {
        let sender = self.sender();
        let id = self.outbox.next_msg_id();
        match seal(&sender, &HostSpec::broadcast(DaemonKind::Controller), id, msg) {
            Ok(wire) => self.outbox.push(wire),
            Err(e) => error!("Cannot encode {} message: {}", msg.command(), e),
        }
    }

    async fn handle_exec_event(&mut self, result: OpResult) {
        debug!(
            "Op result: {} call {} rc {} ({:?})",
            result.key(),
            result.call_id,
            result.rc,
            result.status
        );
        // History first, so the store sees the op even when the graph no
        // longer wants it. Results carry no node name; the owning interface
        // is the one tracking the call id.
        let node = self
            .executors
            .iter()
            .find(|(_, executor)| executor.pending.get(result.call_id).is_some())
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| self.config.uname.clone());
        if let Some(executor) = self.executors.get_mut(&node) {
            executor.process_result(&result, &self.cib);
        }
        self.engine.handle_op_result(&result);
        self.pump_transition().await;
    }

    /// Operator-requested reprobe of this node: wipe the recorded history,
    /// unset the probed flag, and post the explicit recompute input so the
    /// policy engine re-emits probes.
    async fn reprobe_local(&mut self) {
        let node = self.config.uname.clone();
        if let Some(executor) = self.executors.get_mut(&node) {
            executor.reprobe(&self.cib);
        }
        self.engine.abort(0, AbortAction::Recompute, "reprobe");
        self.broadcast(&ClusterMsg::Recompute {
            reason: format!("reprobe of {}", node),
        });
        self.pump_transition().await;
    }

    async fn tick(&mut self) {
        let expired = self.engine.expire_deadlines();
        if !expired.is_empty() {
            warn!("{} actions expired", expired.len());
            self.pump_transition().await;
        }
        let reaped = self.cache.reap();
        if reaped > 0 {
            debug!("Reaped {} departed peers", reaped);
        }
        // The bus connection is external; until it is attached, just
        // surface the backlog.
        if !self.outbox.is_empty() {
            debug!("{} messages waiting for the bus", self.outbox.len());
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("regent=info".parse().expect("static directive parses")),
        )
        .init();

    let args = Args::parse();

    let config = CoreConfig {
        uname: args.node_name.clone(),
        uuid: if args.node_id > 0 {
            args.node_id.to_string()
        } else {
            args.node_name.clone()
        },
        node_id: (args.node_id > 0).then_some(args.node_id),
        batch_limit: args.batch_limit,
        psk_path: args.psk,
        psk_fallback_path: args.psk_fallback,
        autoreap: !args.no_autoreap,
        ..CoreConfig::default()
    };

    info!("Regent v{} starting on {}", VERSION, config.uname);

    let (cib, mut cib_rx) = CibClient::channel();
    let (mut controller, mut exec_rx) = Controller::new(config, cib);

    if let Some(remotes) = &args.remotes {
        for entry in remotes.split(',') {
            match entry.trim().split_once('=') {
                Some((name, addr)) => controller.add_remote(name, addr),
                None => warn!("Ignoring malformed remote spec {:?}", entry),
            }
        }
    }
    controller.engine.set_state(ControllerState::Pending);

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut status = tokio::time::interval(Duration::from_secs(30));
    // SIGUSR1 is the admin surface for "forget what you know and re-probe".
    let mut reprobe_signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        .expect("SIGUSR1 handler installs");

    info!("Regent running; waiting for cluster inputs");
    loop {
        tokio::select! {
            Some(result) = exec_rx.recv() => {
                controller.handle_exec_event(result).await;
            }
            Some(req) = cib_rx.recv() => {
                // Store replication is external; surface what would be
                // written for observability.
                match &req {
                    CibRequest::StonithUpdate { target, .. } => {
                        info!("Store: stonith update for {}", target)
                    }
                    other => debug!("Store update: {:?}", other),
                }
            }
            _ = tick.tick() => {
                controller.tick().await;
            }
            _ = status.tick() => {
                info!(
                    "Status: {} peers | graph {:?} | {} executors | {} queued messages",
                    controller.cache.len(),
                    controller.engine.graph_id(),
                    controller.executors.len(),
                    controller.outbox.len()
                );
            }
            _ = reprobe_signal.recv() => {
                info!("Reprobe requested via SIGUSR1");
                controller.reprobe_local().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                controller.engine.set_state(ControllerState::Stopping);
                break;
            }
        }
    }
}
