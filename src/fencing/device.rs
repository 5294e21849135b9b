//! Fencing devices and host-check policies

use super::command::FenceCommand;
use crate::executor::agent::AgentOutcome;
use crate::types::now;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

/// How long a cached `list` answer stays valid.
pub const DYNAMIC_LIST_TTL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum FenceError {
    #[error("no device can fence {0}")]
    NoDevice(String),
    #[error("device {device} agent returned rc {rc}")]
    AgentError { device: String, rc: i32 },
    #[error("malformed host map entry: {0}")]
    BadHostMap(String),
    #[error("invalid fencing command: {0}")]
    InvalidCommand(String),
}

/// The rule by which a device decides whether a target is within its power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostCheck {
    /// Device claims every host.
    None,
    /// Target must appear in the configured host list.
    StaticList,
    /// Target must appear in the agent's `list` output, cached briefly.
    DynamicList,
    /// Ask the agent's `status` action about the specific target.
    Status,
}

/// Parse a host map: `NAME(=|:)VALUE` pairs separated by whitespace, comma
/// or semicolon. Tolerant of trailing separators; a name token without a
/// separator is rejected.
pub fn parse_host_map(input: &str) -> Result<BTreeMap<String, String>, FenceError> {
    let mut map = BTreeMap::new();
    for token in input.split([' ', '\t', '\n', ',', ';']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let separator = token
            .find(['=', ':'])
            .ok_or_else(|| FenceError::BadHostMap(token.to_string()))?;
        let (name, value) = token.split_at(separator);
        if name.is_empty() {
            return Err(FenceError::BadHostMap(token.to_string()));
        }
        map.insert(name.to_string(), value[1..].to_string());
    }
    Ok(map)
}

/// Something that can run a fencing agent for a device. The coordinator
/// provides the child-process implementation; tests substitute scripted
/// answers.
pub trait FenceAgentRunner {
    async fn run(
        &mut self,
        device: &mut FenceDevice,
        action: &str,
        victim: Option<&str>,
        timeout_ms: u64,
    ) -> AgentOutcome;
}

#[derive(Debug, Clone)]
pub struct FenceDevice {
    pub id: String,
    /// Agent executable name.
    pub agent: String,
    pub namespace: String,
    pub params: BTreeMap<String, String>,
    /// Cluster node name -> device-local port/id.
    pub aliases: BTreeMap<String, String>,
    pub host_list: Vec<String>,
    pub check: HostCheck,
    pub priority: i32,
    /// Pid of the running child; 0 when idle.
    pub active_pid: u32,
    pub queue: VecDeque<FenceCommand>,
    list_cache: Option<(Vec<String>, u64)>,
    dynamic_disabled: bool,
}

impl FenceDevice {
    pub fn new(id: &str, agent: &str, check: HostCheck) -> Self {
        Self {
            id: id.to_string(),
            agent: agent.to_string(),
            namespace: "stonith".to_string(),
            params: BTreeMap::new(),
            aliases: BTreeMap::new(),
            host_list: Vec::new(),
            check,
            priority: 0,
            active_pid: 0,
            queue: VecDeque::new(),
            list_cache: None,
            dynamic_disabled: false,
        }
    }

    /// The device-local name for a target, after alias substitution.
    pub fn port_for(&self, target: &str) -> String {
        self.aliases
            .get(target)
            .cloned()
            .unwrap_or_else(|| target.to_string())
    }

    pub fn dynamic_disabled(&self) -> bool {
        self.dynamic_disabled
    }

    fn in_static_list(&self, target: &str) -> bool {
        self.host_list.iter().any(|h| h == target) || self.host_list.contains(&self.port_for(target))
    }

    async fn dynamic_list<R: FenceAgentRunner>(&mut self, runner: &mut R) -> Option<&[String]> {
        if self.dynamic_disabled {
            return None;
        }
        let fresh = self
            .list_cache
            .as_ref()
            .is_some_and(|(_, at)| now().saturating_sub(*at) < DYNAMIC_LIST_TTL_SECS);
        if !fresh {
            let outcome = runner.run(&mut *self, "list", None, 10_000).await;
            if outcome.rc.code() != 0 {
                // One failed list permanently demotes the device; asking
                // again would stall every selection pass.
                warn!(
                    "Device {} list action failed (rc {}); disabling dynamic host checks",
                    self.id,
                    outcome.rc.code()
                );
                self.dynamic_disabled = true;
                self.list_cache = None;
                return None;
            }
            let hosts: Vec<String> = outcome
                .stdout
                .lines()
                .filter_map(|line| line.split_whitespace().next())
                .map(|h| h.to_string())
                .collect();
            debug!("Device {} can reach {} hosts", self.id, hosts.len());
            self.list_cache = Some((hosts, now()));
        }
        self.list_cache.as_ref().map(|(hosts, _)| hosts.as_slice())
    }

    /// Can this device act on the target, per its host-check policy?
    pub async fn can_fence<R: FenceAgentRunner>(
        &mut self,
        target: &str,
        runner: &mut R,
    ) -> Result<bool, FenceError> {
        match self.check {
            HostCheck::None => Ok(true),
            HostCheck::StaticList => Ok(self.in_static_list(target)),
            HostCheck::DynamicList => {
                let port = self.port_for(target);
                match self.dynamic_list(runner).await {
                    Some(hosts) => {
                        Ok(hosts.iter().any(|h| h == target) || hosts.iter().any(|h| *h == port))
                    }
                    None => Ok(false),
                }
            }
            HostCheck::Status => {
                let outcome = runner.run(&mut *self, "status", Some(target), 10_000).await;
                match outcome.rc.code() {
                    0 | 2 => Ok(true),
                    1 => Ok(false),
                    rc => Err(FenceError::AgentError {
                        device: self.id.clone(),
                        rc,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{ExecRc, OpStatus};

    /// Scripted runner: maps (device, action) to a canned outcome.
    pub(crate) struct ScriptedRunner {
        pub answers: BTreeMap<(String, String), (i32, String)>,
        pub calls: Vec<(String, String, Option<String>)>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self {
                answers: BTreeMap::new(),
                calls: Vec::new(),
            }
        }

        pub fn script(&mut self, device: &str, action: &str, rc: i32, stdout: &str) {
            self.answers
                .insert((device.to_string(), action.to_string()), (rc, stdout.to_string()));
        }
    }

    impl FenceAgentRunner for ScriptedRunner {
        async fn run(
            &mut self,
            device: &mut FenceDevice,
            action: &str,
            victim: Option<&str>,
            _timeout_ms: u64,
        ) -> AgentOutcome {
            self.calls.push((
                device.id.clone(),
                action.to_string(),
                victim.map(|v| v.to_string()),
            ));
            let (rc, stdout) = self
                .answers
                .get(&(device.id.clone(), action.to_string()))
                .cloned()
                .unwrap_or((1, String::new()));
            AgentOutcome {
                rc: ExecRc::from_exit(rc),
                status: OpStatus::Done,
                stdout,
                stderr: String::new(),
                exec_time_ms: 1,
                pid: 0,
            }
        }
    }

    #[test]
    fn test_host_map_parse() {
        let map = parse_host_map("n1:1 n2=2;n3:ipmi-3 ,  ").unwrap();
        assert_eq!(map.get("n1").map(String::as_str), Some("1"));
        assert_eq!(map.get("n2").map(String::as_str), Some("2"));
        assert_eq!(map.get("n3").map(String::as_str), Some("ipmi-3"));
    }

    #[test]
    fn test_host_map_rejects_bare_name() {
        assert!(parse_host_map("n1:1 n2").is_err());
        assert!(parse_host_map("=1").is_err());
    }

    #[tokio::test]
    async fn test_policy_none_accepts_all() {
        let mut device = FenceDevice::new("d0", "fence_true", HostCheck::None);
        let mut runner = ScriptedRunner::new();
        assert!(device.can_fence("anything", &mut runner).await.unwrap());
        assert!(runner.calls.is_empty());
    }

    #[tokio::test]
    async fn test_static_list_with_alias() {
        let mut device = FenceDevice::new("d1", "fence_pdu", HostCheck::StaticList);
        device.host_list = vec!["plug4".to_string()];
        device.aliases = parse_host_map("n2=plug4").unwrap();
        let mut runner = ScriptedRunner::new();
        assert!(device.can_fence("n2", &mut runner).await.unwrap());
        assert!(!device.can_fence("n5", &mut runner).await.unwrap());
    }

    #[tokio::test]
    async fn test_dynamic_list_caches() {
        let mut device = FenceDevice::new("d2", "fence_ipmi", HostCheck::DynamicList);
        let mut runner = ScriptedRunner::new();
        runner.script("d2", "list", 0, "n1 on\nn2 off\n");

        assert!(device.can_fence("n1", &mut runner).await.unwrap());
        assert!(device.can_fence("n2", &mut runner).await.unwrap());
        assert!(!device.can_fence("n9", &mut runner).await.unwrap());
        // One list invocation served all three checks.
        let lists = runner.calls.iter().filter(|(_, a, _)| a == "list").count();
        assert_eq!(lists, 1);
    }

    #[tokio::test]
    async fn test_dynamic_list_failure_disables_permanently() {
        let mut device = FenceDevice::new("d3", "fence_ipmi", HostCheck::DynamicList);
        let mut runner = ScriptedRunner::new();
        runner.script("d3", "list", 1, "");

        assert!(!device.can_fence("n1", &mut runner).await.unwrap());
        assert!(device.dynamic_disabled());

        // Even a now-working agent is not asked again.
        runner.script("d3", "list", 0, "n1\n");
        assert!(!device.can_fence("n1", &mut runner).await.unwrap());
        let lists = runner.calls.iter().filter(|(_, a, _)| a == "list").count();
        assert_eq!(lists, 1);
    }

    #[tokio::test]
    async fn test_status_rc_mapping() {
        let mut device = FenceDevice::new("d4", "fence_x", HostCheck::Status);
        let mut runner = ScriptedRunner::new();

        runner.script("d4", "status", 0, "");
        assert!(device.can_fence("n1", &mut runner).await.unwrap());

        runner.script("d4", "status", 2, "");
        assert!(device.can_fence("n1", &mut runner).await.unwrap());

        runner.script("d4", "status", 1, "");
        assert!(!device.can_fence("n1", &mut runner).await.unwrap());

        runner.script("d4", "status", 5, "");
        assert!(device.can_fence("n1", &mut runner).await.is_err());
    }
}
