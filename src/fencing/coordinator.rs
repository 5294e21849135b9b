//! Fencing coordination: device selection, execution, outcome handling

use super::command::{is_power_action, FenceCommand, FenceOutcome};
use super::device::{parse_host_map, FenceAgentRunner, FenceDevice, FenceError};
use crate::cib::CibClient;
use crate::executor::agent::{run_agent, AgentOutcome, AgentSpec, DEVICE_ID_ENV};
use crate::membership::{CacheFilter, ExpectedState, JoinPhase, Liveness, PeerCache};
use crate::types::ExecRc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Runs fencing agents as child processes. Parameters go on stdin; the
/// victim appears as both `port` (after alias substitution) and `nodename`.
pub struct ChildAgentRunner {
    pub agent_root: PathBuf,
}

impl Default for ChildAgentRunner {
    fn default() -> Self {
        Self {
            agent_root: PathBuf::from("/usr/sbin"),
        }
    }
}

impl FenceAgentRunner for ChildAgentRunner {
    async fn run(
        &mut self,
        device: &mut FenceDevice,
        action: &str,
        victim: Option<&str>,
        timeout_ms: u64,
    ) -> AgentOutcome {
        let mut params = device.params.clone();
        if let Some(victim) = victim {
            params.insert("port".to_string(), device.port_for(victim));
            params.insert("nodename".to_string(), victim.to_string());
        }
        let spec = AgentSpec {
            program: self.agent_root.join(&device.agent),
            action: action.to_string(),
            params,
            timeout_ms,
            env: vec![(DEVICE_ID_ENV.to_string(), device.id.clone())],
        };
        let outcome = run_agent(&spec).await;
        device.active_pid = 0;
        outcome
    }
}

/// What a processed fencing notification means for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceReaction {
    /// Peer state updated; carry on.
    Updated,
    /// Not a state-changing notification.
    Ignored,
    /// This node itself was fenced: stop processing, halt or exit.
    SelfFenced,
}

/// Exit code used when a fenced node cannot halt. Rejoining the cluster
/// would make peers that already count us dead reject our votes.
pub const SELF_FENCE_EXIT: i32 = 100;

pub struct FenceCoordinator<R: FenceAgentRunner> {
    local_node: String,
    devices: BTreeMap<String, FenceDevice>,
    runner: R,
}

impl<R: FenceAgentRunner> FenceCoordinator<R> {
    pub fn new(local_node: &str, runner: R) -> Self {
        Self {
            local_node: local_node.to_string(),
            devices: BTreeMap::new(),
            runner,
        }
    }

    /// Register a device, deriving its alias map and host list from the
    /// conventional parameters.
    pub fn register_device(&mut self, mut device: FenceDevice) -> Result<(), FenceError> {
        if let Some(map) = device.params.get("host_map") {
            device.aliases = parse_host_map(map)?;
        }
        if let Some(list) = device.params.get("host_list") {
            device.host_list = list.split_whitespace().map(|h| h.to_string()).collect();
        }
        info!("Registered fencing device {} ({})", device.id, device.agent);
        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    pub fn remove_device(&mut self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    pub fn device(&self, id: &str) -> Option<&FenceDevice> {
        self.devices.get(id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Devices capable of fencing the target, best priority first.
    pub async fn select(&mut self, target: &str) -> Vec<String> {
        let ids: Vec<String> = self.devices.keys().cloned().collect();
        let mut capable: Vec<(i32, String)> = Vec::new();
        for id in ids {
            let Some(device) = self.devices.get_mut(&id) else {
                continue;
            };
            match device.can_fence(target, &mut self.runner).await {
                Ok(true) => capable.push((device.priority, id)),
                Ok(false) => {}
                Err(e) => warn!("Host check on device {} failed: {}", id, e),
            }
        }
        capable.sort_by(|a, b| b.0.cmp(&a.0));
        capable.into_iter().map(|(_, id)| id).collect()
    }

    /// Run a command through its device fallback chain. Each device handles
    /// one child at a time; failure hands the command to the next device;
    /// exhaustion returns the final failure to the originator.
    pub async fn execute(&mut self, mut cmd: FenceCommand) -> FenceOutcome {
        let target = cmd.victim.clone();
        let action = cmd.action.clone();
        let origin = cmd.origin.clone();
        let id = cmd.id;
        let executioner = self.local_node.clone();
        let outcome_base = move |rc: i32, device: Option<String>| FenceOutcome {
            target: target.clone(),
            action: action.clone(),
            rc,
            origin: origin.clone(),
            id,
            executioner: executioner.clone(),
            device,
        };

        let Some(victim) = cmd.victim.clone() else {
            warn!("Fencing command {} has no victim", cmd.id);
            return outcome_base(ExecRc::InvalidParam.code(), None);
        };

        if cmd.fallback.is_empty() {
            cmd.fallback = self.select(&victim).await;
        }
        if cmd.fallback.is_empty() {
            error!("No fencing device can reach {}", victim);
            return outcome_base(ExecRc::NotInstalled.code(), None);
        }

        let mut last_rc = ExecRc::Error.code();
        let mut last_device = None;
        while !cmd.fallback.is_empty() {
            let device_id = cmd.fallback.remove(0);
            let Some(device) = self.devices.get_mut(&device_id) else {
                continue;
            };

            device.queue.push_back(cmd.clone());
            // One active child per device: the queue head runs, the rest
            // wait for this await to resolve.
            let running = match device.queue.pop_front() {
                Some(cmd) => cmd,
                None => continue,
            };
            let outcome = self
                .runner
                .run(device, &running.action, Some(&victim), running.timeout_ms)
                .await;
            let rc = outcome.rc.code();

            if rc == 0 {
                info!(
                    "Device {} fenced {} ({}) for {}",
                    device_id, victim, running.action, running.origin
                );
                return outcome_base(0, Some(device_id));
            }

            warn!(
                "Device {} failed to fence {} (rc {}); {} fallback devices left",
                device_id,
                victim,
                rc,
                cmd.fallback.len()
            );
            last_rc = rc;
            last_device = Some(device_id);
        }

        error!("All devices failed to fence {} (final rc {})", victim, last_rc);
        outcome_base(last_rc, last_device)
    }

    /// Apply a broadcast fencing outcome to the local view. Every peer
    /// converges on: target lost, join phase cleared, expected down. The
    /// leader additionally records the event in the configuration store.
    pub fn handle_notify(
        &mut self,
        outcome: &FenceOutcome,
        cache: &mut PeerCache,
        cib: &CibClient,
        is_leader: bool,
    ) -> FenceReaction {
        if !outcome.succeeded() || !is_power_action(&outcome.action) {
            return FenceReaction::Ignored;
        }
        let Some(target) = outcome.target.as_deref() else {
            return FenceReaction::Ignored;
        };

        if target == self.local_node {
            error!(
                "We were fenced by {} (via {:?}); terminating",
                outcome.executioner, outcome.device
            );
            return FenceReaction::SelfFenced;
        }

        match cache.lookup_or_create(None, Some(target), CacheFilter::Any) {
            Ok(node) => {
                let uuid = node.uuid.clone();
                cache.set_liveness(&uuid, Liveness::Lost);
                cache.set_join(&uuid, JoinPhase::None);
                cache.set_expected(&uuid, ExpectedState::Down);
            }
            Err(e) => warn!("Cannot update fenced peer {}: {}", target, e),
        }

        if is_leader {
            cib.stonith_update(target, &outcome.origin.to_string());
        }
        info!(
            "Peer {} fenced by {}; membership updated",
            target, outcome.executioner
        );
        FenceReaction::Updated
    }
}
