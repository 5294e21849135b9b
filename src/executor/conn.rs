//! Executor connections and the per-node operation interface
//!
//! Local (trusted) and remote (PSK-authenticated) executors share one
//! operation surface; `ExecutorConn` is the sum type over the two
//! transports. `NodeExecutor` wraps a connection with the history cache,
//! the pending-op table and the result-synthesis rules, so the transition
//! engine always receives a deterministic completion.

use super::history::{instance_params, param_digest, HistoryTable, OpRecord, RecordDisposition};
use super::local::LocalExecutor;
use super::op::{
    validate_rsc_id, ExecRequest, OpKey, OpResult, PendingOp, PendingTable, RscDefinition,
    TransitionMagic, META_PREFIX,
};
use super::remote::{RemoteExecutor, RemoteOp, RemoteReplyBody};
use crate::cib::{CibClient, ATTR_LAST_REFRESH, ATTR_PROBED};
use crate::types::{now, ExecRc, OpStatus};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("not connected")]
    NotConnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("frame failed authentication")]
    Crypto,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    ProtocolMismatch { ours: u32, theirs: u32 },
    #[error("key file unusable: {0}")]
    Psk(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid resource definition: {0}")]
    InvalidDefinition(String),
    #[error("unsupported resource class {0}")]
    UnsupportedClass(String),
    #[error("no such operation {0}")]
    NoSuchOp(String),
    #[error("agent failed with rc {0}")]
    AgentFailed(i32),
    #[error("permission denied")]
    Unauthorized,
    #[error("remote executor error: {0}")]
    Remote(String),
}

impl ExecError {
    /// Fatal errors tear the connection down; the rest are retryable or
    /// surface as synthesized results.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecError::Protocol(_) | ExecError::ProtocolMismatch { .. } | ExecError::Crypto
        )
    }
}

/// The operation surface both transports present. Event delivery is the
/// callback registration: every connection is built around the channel the
/// caller hands it.
pub trait ExecutorBackend {
    fn node(&self) -> &str;
    fn is_connected(&self) -> bool;
    async fn connect(&mut self) -> Result<(), ExecError>;
    fn disconnect(&mut self);
    async fn register(&mut self, def: RscDefinition) -> Result<(), ExecError>;
    async fn unregister(&mut self, rsc: &str) -> Result<(), ExecError>;
    async fn rsc_info(&mut self, rsc: &str) -> Result<Option<RscDefinition>, ExecError>;
    async fn list_standards(&mut self) -> Result<Vec<String>, ExecError>;
    async fn list_providers(&mut self) -> Result<Vec<String>, ExecError>;
    async fn list_agents(
        &mut self,
        class: &str,
        provider: Option<&str>,
    ) -> Result<Vec<String>, ExecError>;
    async fn metadata(&mut self, def: &RscDefinition) -> Result<String, ExecError>;
    async fn exec(&mut self, req: ExecRequest) -> Result<i64, ExecError>;
    async fn cancel(&mut self, key: &OpKey) -> Result<i64, ExecError>;
    async fn list_recurring(&mut self) -> Result<Vec<OpKey>, ExecError>;
    async fn poke(&mut self) -> Result<(), ExecError>;
}

impl ExecutorBackend for LocalExecutor {
    fn node(&self) -> &str {
        LocalExecutor::node(self)
    }

    fn is_connected(&self) -> bool {
        self.poke()
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        LocalExecutor::connect(self)
    }

    fn disconnect(&mut self) {
        LocalExecutor::disconnect(self)
    }

    async fn register(&mut self, def: RscDefinition) -> Result<(), ExecError> {
        LocalExecutor::register(self, def)
    }

    async fn unregister(&mut self, rsc: &str) -> Result<(), ExecError> {
        LocalExecutor::unregister(self, rsc);
        Ok(())
    }

    async fn rsc_info(&mut self, rsc: &str) -> Result<Option<RscDefinition>, ExecError> {
        Ok(LocalExecutor::rsc_info(self, rsc).cloned())
    }

    async fn list_standards(&mut self) -> Result<Vec<String>, ExecError> {
        Ok(LocalExecutor::list_standards(self))
    }

    async fn list_providers(&mut self) -> Result<Vec<String>, ExecError> {
        Ok(LocalExecutor::list_providers(self))
    }

    async fn list_agents(
        &mut self,
        class: &str,
        provider: Option<&str>,
    ) -> Result<Vec<String>, ExecError> {
        Ok(LocalExecutor::list_agents(self, class, provider))
    }

    async fn metadata(&mut self, def: &RscDefinition) -> Result<String, ExecError> {
        LocalExecutor::metadata(self, def).await
    }

    async fn exec(&mut self, req: ExecRequest) -> Result<i64, ExecError> {
        LocalExecutor::exec(self, req)
    }

    async fn cancel(&mut self, key: &OpKey) -> Result<i64, ExecError> {
        LocalExecutor::cancel(self, key)
    }

    async fn list_recurring(&mut self) -> Result<Vec<OpKey>, ExecError> {
        Ok(LocalExecutor::list_recurring(self))
    }

    async fn poke(&mut self) -> Result<(), ExecError> {
        if LocalExecutor::poke(self) {
            Ok(())
        } else {
            Err(ExecError::NotConnected)
        }
    }
}

impl ExecutorBackend for RemoteExecutor {
    fn node(&self) -> &str {
        RemoteExecutor::node(self)
    }

    fn is_connected(&self) -> bool {
        RemoteExecutor::is_connected(self)
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        RemoteExecutor::connect(self).await
    }

    fn disconnect(&mut self) {
        RemoteExecutor::disconnect(self)
    }

    async fn register(&mut self, def: RscDefinition) -> Result<(), ExecError> {
        match self
            .request(RemoteOp::Register(def), Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::Ack => Ok(()),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn unregister(&mut self, rsc: &str) -> Result<(), ExecError> {
        match self
            .request(RemoteOp::Unregister(rsc.to_string()), Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::Ack => Ok(()),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn rsc_info(&mut self, rsc: &str) -> Result<Option<RscDefinition>, ExecError> {
        match self
            .request(RemoteOp::RscInfo(rsc.to_string()), Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::Info(def) => Ok(def),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn list_standards(&mut self) -> Result<Vec<String>, ExecError> {
        match self
            .request(RemoteOp::ListStandards, Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::Names(names) => Ok(names),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn list_providers(&mut self) -> Result<Vec<String>, ExecError> {
        match self
            .request(RemoteOp::ListProviders, Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::Names(names) => Ok(names),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn list_agents(
        &mut self,
        class: &str,
        provider: Option<&str>,
    ) -> Result<Vec<String>, ExecError> {
        let op = RemoteOp::ListAgents {
            class: class.to_string(),
            provider: provider.map(|p| p.to_string()),
        };
        match self.request(op, Duration::from_secs(10)).await? {
            RemoteReplyBody::Names(names) => Ok(names),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn metadata(&mut self, def: &RscDefinition) -> Result<String, ExecError> {
        match self
            .request(RemoteOp::Metadata(def.clone()), Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::Text(text) => Ok(text),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn exec(&mut self, req: ExecRequest) -> Result<i64, ExecError> {
        let wait = Duration::from_millis(req.timeout_ms);
        match self.request(RemoteOp::Exec(req), wait).await? {
            RemoteReplyBody::CallId(id) => Ok(id),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn cancel(&mut self, key: &OpKey) -> Result<i64, ExecError> {
        match self
            .request(RemoteOp::Cancel(key.clone()), Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::CallId(id) => Ok(id),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn list_recurring(&mut self) -> Result<Vec<OpKey>, ExecError> {
        match self
            .request(RemoteOp::ListRecurring, Duration::from_secs(10))
            .await?
        {
            RemoteReplyBody::Recurring(keys) => Ok(keys),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    async fn poke(&mut self) -> Result<(), ExecError> {
        match self.request(RemoteOp::Poke, Duration::from_secs(10)).await? {
            RemoteReplyBody::Ack | RemoteReplyBody::CallId(_) => Ok(()),
            RemoteReplyBody::Err(e) => Err(ExecError::Remote(e)),
            other => Err(ExecError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }
}

/// One connection per target node: trusted transport for the node we run
/// on, authenticated stream for remote nodes.
pub enum ExecutorConn {
    Local(LocalExecutor),
    Remote(RemoteExecutor),
}

// Dispatch through the trait explicitly: both variants also carry inherent
// methods of the same names, and those must not shadow the shared surface.
macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            ExecutorConn::Local($inner) => $body,
            ExecutorConn::Remote($inner) => $body,
        }
    };
}

impl ExecutorConn {
    pub fn node(&self) -> &str {
        delegate!(self, c => ExecutorBackend::node(c))
    }

    pub fn is_connected(&self) -> bool {
        delegate!(self, c => ExecutorBackend::is_connected(c))
    }

    pub async fn connect(&mut self) -> Result<(), ExecError> {
        delegate!(self, c => ExecutorBackend::connect(c).await)
    }

    pub fn disconnect(&mut self) {
        delegate!(self, c => ExecutorBackend::disconnect(c))
    }

    pub async fn register(&mut self, def: RscDefinition) -> Result<(), ExecError> {
        delegate!(self, c => ExecutorBackend::register(c, def).await)
    }

    pub async fn unregister(&mut self, rsc: &str) -> Result<(), ExecError> {
        delegate!(self, c => ExecutorBackend::unregister(c, rsc).await)
    }

    pub async fn rsc_info(&mut self, rsc: &str) -> Result<Option<RscDefinition>, ExecError> {
        delegate!(self, c => ExecutorBackend::rsc_info(c, rsc).await)
    }

    pub async fn list_standards(&mut self) -> Result<Vec<String>, ExecError> {
        delegate!(self, c => ExecutorBackend::list_standards(c).await)
    }

    pub async fn list_providers(&mut self) -> Result<Vec<String>, ExecError> {
        delegate!(self, c => ExecutorBackend::list_providers(c).await)
    }

    pub async fn list_agents(
        &mut self,
        class: &str,
        provider: Option<&str>,
    ) -> Result<Vec<String>, ExecError> {
        delegate!(self, c => ExecutorBackend::list_agents(c, class, provider).await)
    }

    pub async fn metadata(&mut self, def: &RscDefinition) -> Result<String, ExecError> {
        delegate!(self, c => ExecutorBackend::metadata(c, def).await)
    }

    pub async fn exec(&mut self, req: ExecRequest) -> Result<i64, ExecError> {
        delegate!(self, c => ExecutorBackend::exec(c, req).await)
    }

    pub async fn cancel(&mut self, key: &OpKey) -> Result<i64, ExecError> {
        delegate!(self, c => ExecutorBackend::cancel(c, key).await)
    }

    pub async fn list_recurring(&mut self) -> Result<Vec<OpKey>, ExecError> {
        delegate!(self, c => ExecutorBackend::list_recurring(c).await)
    }

    pub async fn poke(&mut self) -> Result<(), ExecError> {
        delegate!(self, c => ExecutorBackend::poke(c).await)
    }
}

/// Acknowledgement for a cancel request. Issuing cancel twice yields the
/// same ack; the pending entry only leaves when the executor confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    InProgress,
    Unknown,
}

/// Per-node executor interface: connection + history + pending ops.
pub struct NodeExecutor {
    node: String,
    pub conn: ExecutorConn,
    pub history: HistoryTable,
    pub pending: PendingTable,
    defs: HashMap<String, RscDefinition>,
    events: mpsc::UnboundedSender<OpResult>,
}

impl NodeExecutor {
    pub fn new(conn: ExecutorConn, events: mpsc::UnboundedSender<OpResult>) -> Self {
        Self {
            node: conn.node().to_string(),
            conn,
            history: HistoryTable::new(),
            pending: PendingTable::new(),
            defs: HashMap::new(),
            events,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Fabricate a completion the transition engine can consume when the
    /// request could not even be dispatched. Notify operations always
    /// fabricate success.
    fn synthesize(&mut self, req: &ExecRequest, error: &ExecError) -> OpResult {
        let (rc, status) = if req.task == "notify" {
            (ExecRc::Ok.code(), OpStatus::Done)
        } else {
            match error {
                ExecError::InvalidDefinition(_) | ExecError::UnsupportedClass(_) => {
                    (ExecRc::NotConfigured.code(), OpStatus::Invalid)
                }
                ExecError::Unauthorized => (ExecRc::InsufficientPriv.code(), OpStatus::Error),
                ExecError::Timeout => (ExecRc::UnknownError.code(), OpStatus::Timeout),
                _ => (ExecRc::UnknownError.code(), OpStatus::NotConnected),
            }
        };

        let call_id = self.pending.next_synthetic_id();
        OpResult {
            rsc: req.rsc.id.clone(),
            task: req.task.clone(),
            interval_ms: req.interval_ms,
            call_id,
            rc,
            status,
            magic: req.transition_key.clone().map(|key| TransitionMagic {
                op_status: status.code(),
                op_rc: rc,
                key,
            }),
            params: req.params.clone(),
            exec_time_ms: 0,
            finished_at: now(),
            synthetic: true,
            deleted: false,
            lock_time: None,
        }
    }

    /// Dispatch an operation, substituting cached stop parameters and
    /// falling back to a synthesized result when the executor is out of
    /// reach. Returns the call id the result will carry.
    pub async fn dispatch(&mut self, mut req: ExecRequest) -> i64 {
        // Stops run with the parameters captured at start, never the
        // newest configuration.
        if req.task == "stop" {
            if let Some(entry) = self.history.get(&req.rsc.id) {
                if !entry.stop_params.is_empty() {
                    let meta: BTreeMap<String, String> = req
                        .params
                        .iter()
                        .filter(|(k, _)| k.starts_with(META_PREFIX))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    req.params = entry.stop_params.clone();
                    req.params.extend(meta);
                }
            }
        }

        self.defs.insert(req.rsc.id.clone(), req.rsc.clone());

        let outcome = match validate_rsc_id(&req.rsc.id) {
            Err(e) => Err(ExecError::InvalidDefinition(e.to_string())),
            Ok(()) => self.conn.exec(req.clone()).await,
        };

        match outcome {
            Ok(call_id) => {
                self.pending.insert(PendingOp {
                    call_id,
                    key: req.key(),
                    started_at: now(),
                    transition_key: req.transition_key.clone(),
                    lock_time: req.lock_time,
                    remove_on_complete: req.interval_ms == 0,
                    cancelled: false,
                    synthetic: false,
                });
                call_id
            }
            Err(e) => {
                warn!("Cannot dispatch {} on {}: {}", req.key(), self.node, e);
                let result = self.synthesize(&req, &e);
                let call_id = result.call_id;
                if self.events.send(result).is_err() {
                    warn!("Event channel closed while synthesizing failure");
                }
                call_id
            }
        }
    }

    /// Apply a completed operation: update pending bookkeeping, record
    /// history and mirror it to the configuration store.
    pub fn process_result(&mut self, result: &OpResult, cib: &CibClient) -> RecordDisposition {
        if let Some(pending) = self.pending.get(result.call_id) {
            let done = result.deleted
                || result.status == OpStatus::Cancelled
                || pending.remove_on_complete;
            if done {
                self.pending.remove(result.call_id);
            }
        }
        if result.deleted {
            self.pending.remove_for_resource(&result.rsc);
        }

        let def = self
            .defs
            .get(&result.rsc)
            .cloned()
            .or_else(|| self.history.get(&result.rsc).map(|h| h.rsc.clone()))
            .unwrap_or_else(|| RscDefinition {
                id: result.rsc.clone(),
                class: "ocf".to_string(),
                provider: None,
                ty: result.rsc.clone(),
            });

        let disposition = self.history.record(&def, result);
        match &disposition {
            RecordDisposition::Deleted => {
                cib.delete_resource(&self.node, &result.rsc);
            }
            RecordDisposition::CancelledRemoved => {
                cib.erase_op(&self.node, &result.rsc, result.key(), result.call_id);
            }
            RecordDisposition::CancelledDropped => {}
            RecordDisposition::Failed
            | RecordDisposition::Recurring
            | RecordDisposition::Succeeded { .. } => {
                let lock = self
                    .history
                    .get(&result.rsc)
                    .and_then(|entry| entry.lock_until);
                let digest = param_digest(&instance_params(&result.params));
                cib.update_history(
                    &self.node,
                    &result.rsc,
                    OpRecord::from_result(result),
                    lock,
                    Some(digest),
                );
            }
        }
        disposition
    }

    /// Two-phase cancellation: mark the pending entry, ask the executor,
    /// and keep the entry until confirmation arrives so shutdown blocks on
    /// unresolved cancels. A second cancel returns the same ack.
    pub async fn cancel_op(&mut self, key: &OpKey) -> CancelAck {
        let Some(pending) = self.pending.find_by_key_mut(key) else {
            return CancelAck::Unknown;
        };
        if pending.cancelled {
            return CancelAck::InProgress;
        }
        pending.cancelled = true;

        match self.conn.cancel(key).await {
            Ok(call_id) => {
                debug!("Cancel of {} accepted as call {}", key, call_id);
            }
            Err(e) => {
                warn!(
                    "Executor on {} cannot cancel {} yet: {}; entry stays pending",
                    self.node, key, e
                );
            }
        }
        CancelAck::InProgress
    }

    /// Cancel by call id when the caller only has the executor's handle.
    pub async fn cancel_call(&mut self, call_id: i64) -> CancelAck {
        let Some(key) = self.pending.get(call_id).map(|p| p.key.clone()) else {
            return CancelAck::Unknown;
        };
        self.cancel_op(&key).await
    }

    /// Forget everything known about this node's resources, on disk and in
    /// memory, and unset the probed flag so probes are re-emitted. Still
    /// bumps the legacy refresh timestamp for peers that watch it. The
    /// caller posts the accompanying recompute input to the controller.
    pub fn reprobe(&mut self, cib: &CibClient) {
        info!("Reprobe requested for {}", self.node);
        self.history.clear();
        cib.erase_history(&self.node, None);
        cib.set_attribute(&self.node, ATTR_PROBED, None);
        cib.set_attribute(&self.node, ATTR_LAST_REFRESH, Some(&now().to_string()));
    }
}
