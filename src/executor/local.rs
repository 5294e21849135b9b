//! Local (trusted) executor: drives agents directly on this node

use super::agent::{run_agent, AgentSpec};
use super::conn::ExecError;
use super::op::{ExecRequest, OpKey, OpResult, RscDefinition, TransitionMagic};
use crate::types::{now, ExecRc, OpStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where agent scripts live, overridable for tests.
#[derive(Debug, Clone)]
pub struct AgentRoots {
    pub ocf: PathBuf,
    pub stonith: PathBuf,
}

impl Default for AgentRoots {
    fn default() -> Self {
        Self {
            ocf: PathBuf::from("/usr/lib/ocf/resource.d"),
            stonith: PathBuf::from("/usr/sbin"),
        }
    }
}

struct RecurringTask {
    call_id: i64,
    handle: JoinHandle<()>,
}

/// Executor for the node we are running on. Operations fan out as child
/// processes; completions come back on the event channel.
pub struct LocalExecutor {
    node: String,
    events: mpsc::UnboundedSender<OpResult>,
    next_call_id: i64,
    connected: bool,
    registered: HashMap<String, RscDefinition>,
    recurring: HashMap<OpKey, RecurringTask>,
    roots: AgentRoots,
}

impl LocalExecutor {
    pub fn new(node: &str, events: mpsc::UnboundedSender<OpResult>, roots: AgentRoots) -> Self {
        Self {
            node: node.to_string(),
            events,
            next_call_id: 0,
            connected: false,
            registered: HashMap::new(),
            recurring: HashMap::new(),
            roots,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn connect(&mut self) -> Result<(), ExecError> {
        self.connected = true;
        info!("Local executor on {} ready", self.node);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
        for (key, task) in self.recurring.drain() {
            debug!("Stopping recurring {} on disconnect", key);
            task.handle.abort();
        }
    }

    pub fn poke(&self) -> bool {
        self.connected
    }

    pub fn register(&mut self, def: RscDefinition) -> Result<(), ExecError> {
        super::op::validate_rsc_id(&def.id).map_err(|e| ExecError::InvalidDefinition(e.to_string()))?;
        self.registered.insert(def.id.clone(), def);
        Ok(())
    }

    pub fn unregister(&mut self, rsc: &str) -> Option<RscDefinition> {
        let def = self.registered.remove(rsc);
        let doomed: Vec<OpKey> = self
            .recurring
            .keys()
            .filter(|k| k.rsc == rsc)
            .cloned()
            .collect();
        for key in doomed {
            if let Some(task) = self.recurring.remove(&key) {
                task.handle.abort();
            }
        }
        def
    }

    pub fn rsc_info(&self, rsc: &str) -> Option<&RscDefinition> {
        self.registered.get(rsc)
    }

    pub fn list_standards(&self) -> Vec<String> {
        vec!["ocf".to_string(), "stonith".to_string()]
    }

    pub fn list_providers(&self) -> Vec<String> {
        std::fs::read_dir(&self.roots.ocf)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_agents(&self, class: &str, provider: Option<&str>) -> Vec<String> {
        let dir = match (class, provider) {
            ("ocf", Some(provider)) => self.roots.ocf.join(provider),
            ("stonith", _) => self.roots.stonith.clone(),
            _ => return Vec::new(),
        };
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn agent_path(&self, def: &RscDefinition) -> Result<PathBuf, ExecError> {
        match def.class.as_str() {
            "ocf" => {
                let provider = def
                    .provider
                    .as_deref()
                    .ok_or_else(|| ExecError::InvalidDefinition(format!("{}: ocf without provider", def.id)))?;
                Ok(self.roots.ocf.join(provider).join(&def.ty))
            }
            "stonith" => Ok(self.roots.stonith.join(&def.ty)),
            other => Err(ExecError::UnsupportedClass(other.to_string())),
        }
    }

    /// Fetch agent metadata by running its `meta-data` action.
    pub async fn metadata(&self, def: &RscDefinition) -> Result<String, ExecError> {
        let spec = AgentSpec {
            program: self.agent_path(def)?,
            action: "meta-data".to_string(),
            params: BTreeMap::new(),
            timeout_ms: 30_000,
            env: Vec::new(),
        };
        let outcome = run_agent(&spec).await;
        if outcome.rc == ExecRc::Ok {
            Ok(outcome.stdout)
        } else {
            Err(ExecError::AgentFailed(outcome.rc.code()))
        }
    }

    fn build_result(req: &ExecRequest, call_id: i64, rc: i32, status: OpStatus, exec_time_ms: u64) -> OpResult {
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
            exec_time_ms,
            finished_at: now(),
            synthetic: false,
            deleted: false,
            lock_time: req.lock_time,
        }
    }

    /// Dispatch an operation. Returns the assigned call id immediately; the
    /// result arrives on the event channel.
    pub fn exec(&mut self, req: ExecRequest) -> Result<i64, ExecError> {
        if !self.connected {
            return Err(ExecError::NotConnected);
        }
        let program = self.agent_path(&req.rsc)?;

        self.next_call_id += 1;
        let call_id = self.next_call_id;
        let events = self.events.clone();

        let spec = AgentSpec {
            program,
            action: req.task.clone(),
            params: req.params.clone(),
            timeout_ms: req.timeout_ms,
            env: Vec::new(),
        };

        if req.interval_ms == 0 {
            tokio::spawn(async move {
                let outcome = run_agent(&spec).await;
                let result =
                    Self::build_result(&req, call_id, outcome.rc.code(), outcome.status, outcome.exec_time_ms);
                let _ = events.send(result);
            });
            return Ok(call_id);
        }

        // Recurring: re-issued on schedule until cancelled. Repeat identical
        // failures are absorbed; a changed rc is reported again.
        let key = req.key();
        if let Some(previous) = self.recurring.remove(&key) {
            debug!("Replacing recurring {}", key);
            previous.handle.abort();
        }
        let interval = Duration::from_millis(req.interval_ms);
        let handle = tokio::spawn(async move {
            let mut last_rc: Option<i32> = None;
            loop {
                tokio::time::sleep(interval).await;
                let outcome = run_agent(&spec).await;
                let rc = outcome.rc.code();
                let repeat_failure = last_rc == Some(rc) && rc != 0;
                last_rc = Some(rc);
                if repeat_failure {
                    continue;
                }
                let result =
                    Self::build_result(&req, call_id, rc, outcome.status, outcome.exec_time_ms);
                if events.send(result).is_err() {
                    return;
                }
            }
        });
        self.recurring.insert(key, RecurringTask { call_id, handle });
        Ok(call_id)
    }

    /// Stop a recurring operation. The cancellation is confirmed by a
    /// `Cancelled` result on the event channel.
    pub fn cancel(&mut self, key: &OpKey) -> Result<i64, ExecError> {
        let task = self
            .recurring
            .remove(key)
            .ok_or_else(|| ExecError::NoSuchOp(key.to_string()))?;
        task.handle.abort();

        let result = OpResult {
            rsc: key.rsc.clone(),
            task: key.task.clone(),
            interval_ms: key.interval_ms,
            call_id: task.call_id,
            rc: 0,
            status: OpStatus::Cancelled,
            magic: None,
            params: BTreeMap::new(),
            exec_time_ms: 0,
            finished_at: now(),
            synthetic: false,
            deleted: false,
            lock_time: None,
        };
        if self.events.send(result).is_err() {
            warn!("Cancellation of {} confirmed into a closed channel", key);
        }
        Ok(task.call_id)
    }

    pub fn list_recurring(&self) -> Vec<OpKey> {
        self.recurring.keys().cloned().collect()
    }
}
