//! Per-node resource operation history
//!
//! One entry per resource: the most recent successful op, the most recent
//! failure, the active recurring set, and the instance parameters captured
//! at last start so a later stop runs with the attributes the resource was
//! started with.

use super::op::{OpResult, RscDefinition, TransitionMagic, META_PREFIX};
use crate::types::{ExecRc, OpStatus};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// A recorded operation, as written to the configuration store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRecord {
    pub task: String,
    pub interval_ms: u64,
    pub call_id: i64,
    pub rc: i32,
    pub status: OpStatus,
    pub finished_at: u64,
    pub magic: Option<TransitionMagic>,
}

impl OpRecord {
    pub fn from_result(result: &OpResult) -> Self {
        Self {
            task: result.task.clone(),
            interval_ms: result.interval_ms,
            call_id: result.call_id,
            rc: result.rc,
            status: result.status,
            finished_at: result.finished_at,
            magic: result.magic.clone(),
        }
    }
}

/// Digest of instance parameters, used to detect configuration drift
/// without a field-by-field compare. Local material only, never the wire.
pub fn param_digest(params: &BTreeMap<String, String>) -> String {
    let encoded = bincode::serialize(params).unwrap_or_default();
    hex::encode(Sha3_256::digest(&encoded))
}

/// Instance-scoped (non-meta) parameters of an operation.
pub fn instance_params(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    params
        .iter()
        .filter(|(k, _)| !k.starts_with(META_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// What `record` did with a result, so the caller can mirror it to the
/// configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDisposition {
    /// Entry purged; surface the deletion.
    Deleted,
    /// A cancelled recurring op left the recurring set.
    CancelledRemoved,
    /// Cancellation of a non-recurring op; logged and dropped.
    CancelledDropped,
    /// Failure recorded in the `failed` slot.
    Failed,
    /// Success recorded; `locked` when a shutdown-lock stamp was preserved.
    Succeeded { locked: bool },
    /// Recurring success merged into the recurring set.
    Recurring,
}

#[derive(Debug, Clone)]
pub struct ResourceHistory {
    pub rsc: RscDefinition,
    pub last: Option<OpRecord>,
    pub failed: Option<OpRecord>,
    recurring: Vec<OpRecord>,
    pub stop_params: BTreeMap<String, String>,
    pub stop_digest: Option<String>,
    pub last_call_id: i64,
    pub lock_until: Option<u64>,
}

impl ResourceHistory {
    pub fn new(rsc: RscDefinition) -> Self {
        Self {
            rsc,
            last: None,
            failed: None,
            recurring: Vec::new(),
            stop_params: BTreeMap::new(),
            stop_digest: None,
            last_call_id: 0,
            lock_until: None,
        }
    }

    pub fn recurring(&self) -> &[OpRecord] {
        &self.recurring
    }

    /// Is the shutdown lock still pinning this resource to its node?
    pub fn lock_active(&self) -> bool {
        self.lock_until
            .is_some_and(|until| (chrono::Utc::now().timestamp().max(0) as u64) < until)
    }

    /// Deduplicate by (task, interval): a re-armed recurring op replaces its
    /// predecessor instead of accumulating.
    fn merge_recurring(&mut self, record: OpRecord) {
        self.recurring
            .retain(|r| !(r.task == record.task && r.interval_ms == record.interval_ms));
        self.recurring.push(record);
    }

    fn drop_recurring(&mut self, task: &str, interval_ms: u64) -> bool {
        let before = self.recurring.len();
        self.recurring
            .retain(|r| !(r.task == task && r.interval_ms == interval_ms));
        self.recurring.len() != before
    }
}

/// Whether a result counts as success against its target rc.
fn op_succeeded(result: &OpResult) -> bool {
    if !result.status.is_success() {
        return false;
    }
    let target = result
        .magic
        .as_ref()
        .map(|m| m.key.target_rc)
        .unwrap_or(ExecRc::Ok.code());
    result.rc == target
}

/// A probe is a zero-interval monitor.
fn is_probe(result: &OpResult) -> bool {
    result.task == "monitor" && result.interval_ms == 0
}

#[derive(Default)]
pub struct HistoryTable {
    entries: HashMap<String, ResourceHistory>,
}

impl HistoryTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, rsc: &str) -> Option<&ResourceHistory> {
        self.entries.get(rsc)
    }

    pub fn get_mut(&mut self, rsc: &str) -> Option<&mut ResourceHistory> {
        self.entries.get_mut(rsc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge(&mut self, rsc: &str) -> bool {
        self.entries.remove(rsc).is_some()
    }

    /// Reprobe support: forget everything known about this node's resources.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Apply an operation result to the history, returning what the caller
    /// must mirror to the configuration store.
    pub fn record(&mut self, rsc: &RscDefinition, result: &OpResult) -> RecordDisposition {
        if result.deleted {
            info!("Resource {} deleted; purging history", rsc.id);
            self.entries.remove(&rsc.id);
            return RecordDisposition::Deleted;
        }

        let entry = self
            .entries
            .entry(rsc.id.clone())
            .or_insert_with(|| ResourceHistory::new(rsc.clone()));
        if result.call_id > entry.last_call_id && !result.synthetic {
            entry.last_call_id = result.call_id;
        }

        if result.status == OpStatus::Cancelled {
            if result.is_recurring() {
                if entry.drop_recurring(&result.task, result.interval_ms) {
                    debug!("Recurring {} cancelled on {}", result.key(), rsc.id);
                    return RecordDisposition::CancelledRemoved;
                }
            }
            debug!("Dropping cancellation of non-recurring {}", result.key());
            return RecordDisposition::CancelledDropped;
        }

        let record = OpRecord::from_result(result);

        // Any non-recurring, non-monitor arrival invalidates the recurring
        // set, success or failure; the scheduler re-arms what should still
        // run.
        if !result.is_recurring() && result.task != "monitor" && !entry.recurring.is_empty() {
            debug!(
                "Purging {} recurring ops for {} after {}",
                entry.recurring.len(),
                rsc.id,
                result.task
            );
            entry.recurring.clear();
        }

        if !op_succeeded(result) {
            warn!(
                "{} on {} failed: rc={} status={:?}",
                result.key(),
                rsc.id,
                result.rc,
                result.status
            );
            entry.failed = Some(record);
            entry.lock_until = None;
            return RecordDisposition::Failed;
        }

        if result.is_recurring() {
            entry.merge_recurring(record);
            return RecordDisposition::Recurring;
        }

        // Shutdown-lock preservation: a clean stop, or a probe that found
        // the resource inactive, keeps the lock stamp. Anything else clears.
        let keeps_lock = result.task == "stop"
            || (is_probe(result) && result.rc == ExecRc::NotRunning.code());
        entry.lock_until = if keeps_lock { result.lock_time } else { None };

        entry.last = Some(record);

        if matches!(result.task.as_str(), "start" | "reload" | "monitor") {
            entry.stop_params = instance_params(&result.params);
            entry.stop_digest = Some(param_digest(&entry.stop_params));
        }

        RecordDisposition::Succeeded {
            locked: entry.lock_until.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::op::OpKey;

    fn rsc() -> RscDefinition {
        RscDefinition {
            id: "db9".to_string(),
            class: "ocf".to_string(),
            provider: Some("heartbeat".to_string()),
            ty: "mysql".to_string(),
        }
    }

    fn result(task: &str, interval: u64, rc: i32, status: OpStatus) -> OpResult {
        OpResult {
            rsc: "db9".to_string(),
            task: task.to_string(),
            interval_ms: interval,
            call_id: 10,
            rc,
            status,
            magic: None,
            params: BTreeMap::new(),
            exec_time_ms: 5,
            finished_at: 1000,
            synthetic: false,
            deleted: false,
            lock_time: None,
        }
    }

    #[test]
    fn test_start_captures_stop_params() {
        let mut table = HistoryTable::new();
        let mut start = result("start", 0, 0, OpStatus::Done);
        start.params.insert("port".to_string(), "3306".to_string());
        start
            .params
            .insert("meta_timeout".to_string(), "60".to_string());

        let d = table.record(&rsc(), &start);
        assert_eq!(d, RecordDisposition::Succeeded { locked: false });

        let entry = table.get("db9").unwrap();
        assert_eq!(entry.stop_params.get("port").map(String::as_str), Some("3306"));
        assert!(!entry.stop_params.contains_key("meta_timeout"));
        assert!(entry.stop_digest.is_some());
        assert_eq!(entry.last.as_ref().unwrap().task, "start");
    }

    #[test]
    fn test_stop_params_survive_config_change() {
        let mut table = HistoryTable::new();
        let mut start = result("start", 0, 0, OpStatus::Done);
        start.params.insert("port".to_string(), "3306".to_string());
        table.record(&rsc(), &start);

        // Newer configuration says 3307; the cached stop params must not.
        let entry = table.get("db9").unwrap();
        assert_eq!(entry.stop_params.get("port").map(String::as_str), Some("3306"));
    }

    #[test]
    fn test_failure_fills_failed_slot() {
        let mut table = HistoryTable::new();
        let fail = result("start", 0, 1, OpStatus::Error);
        assert_eq!(table.record(&rsc(), &fail), RecordDisposition::Failed);
        let entry = table.get("db9").unwrap();
        assert!(entry.failed.is_some());
        assert!(entry.last.is_none());
    }

    #[test]
    fn test_recurring_dedup() {
        let mut table = HistoryTable::new();
        let mon = result("monitor", 30_000, 0, OpStatus::Done);
        table.record(&rsc(), &mon);
        table.record(&rsc(), &mon);
        let entry = table.get("db9").unwrap();
        assert_eq!(entry.recurring().len(), 1);
        let key = OpKey::new("db9", "monitor", 30_000);
        assert_eq!(
            OpKey::new(
                "db9",
                &entry.recurring()[0].task,
                entry.recurring()[0].interval_ms
            ),
            key
        );
    }

    #[test]
    fn test_nonrecurring_purges_recurring() {
        let mut table = HistoryTable::new();
        table.record(&rsc(), &result("monitor", 30_000, 0, OpStatus::Done));
        table.record(&rsc(), &result("stop", 0, 0, OpStatus::Done));
        assert!(table.get("db9").unwrap().recurring().is_empty());
    }

    #[test]
    fn test_failed_stop_still_purges_recurring() {
        let mut table = HistoryTable::new();
        table.record(&rsc(), &result("monitor", 30_000, 0, OpStatus::Done));

        let fail = result("stop", 0, 1, OpStatus::Error);
        assert_eq!(table.record(&rsc(), &fail), RecordDisposition::Failed);
        // The stale monitor entry does not outlive the stop attempt.
        assert!(table.get("db9").unwrap().recurring().is_empty());
    }

    #[test]
    fn test_cancelled_recurring_removed() {
        let mut table = HistoryTable::new();
        table.record(&rsc(), &result("monitor", 30_000, 0, OpStatus::Done));
        let cancel = result("monitor", 30_000, 0, OpStatus::Cancelled);
        assert_eq!(
            table.record(&rsc(), &cancel),
            RecordDisposition::CancelledRemoved
        );
        assert!(table.get("db9").unwrap().recurring().is_empty());
    }

    #[test]
    fn test_deleted_purges_entry() {
        let mut table = HistoryTable::new();
        table.record(&rsc(), &result("start", 0, 0, OpStatus::Done));
        let mut gone = result("monitor", 0, 0, OpStatus::Done);
        gone.deleted = true;
        assert_eq!(table.record(&rsc(), &gone), RecordDisposition::Deleted);
        assert!(table.get("db9").is_none());
    }

    #[test]
    fn test_shutdown_lock_on_clean_stop() {
        let mut table = HistoryTable::new();
        let mut stop = result("stop", 0, 0, OpStatus::Done);
        let until = (chrono::Utc::now().timestamp() as u64) + 600;
        stop.lock_time = Some(until);
        let d = table.record(&rsc(), &stop);
        assert_eq!(d, RecordDisposition::Succeeded { locked: true });
        assert_eq!(table.get("db9").unwrap().lock_until, Some(until));
        assert!(table.get("db9").unwrap().lock_active());

        // A later successful start clears the pin.
        let start = result("start", 0, 0, OpStatus::Done);
        table.record(&rsc(), &start);
        assert_eq!(table.get("db9").unwrap().lock_until, None);
    }

    #[test]
    fn test_inactive_probe_keeps_lock() {
        let mut table = HistoryTable::new();
        let mut probe = result("monitor", 0, ExecRc::NotRunning.code(), OpStatus::Done);
        probe.lock_time = Some(42);
        // Probe target defaults to rc 0, so mark it expected via magic.
        probe.magic = Some(TransitionMagic {
            op_status: 0,
            op_rc: ExecRc::NotRunning.code(),
            key: crate::executor::op::TransitionKey {
                action_id: 1,
                graph_id: 1,
                target_rc: ExecRc::NotRunning.code(),
                dc_uuid: "dc".to_string(),
            },
        });
        let d = table.record(&rsc(), &probe);
        assert_eq!(d, RecordDisposition::Succeeded { locked: true });
        assert_eq!(table.get("db9").unwrap().lock_until, Some(42));
    }

    #[test]
    fn test_reprobe_clear() {
        let mut table = HistoryTable::new();
        table.record(&rsc(), &result("start", 0, 0, OpStatus::Done));
        table.clear();
        assert!(table.is_empty());
    }
}
