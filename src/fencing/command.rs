//! Fencing commands and their outcomes

use crate::types::Origin;
use serde::{Deserialize, Serialize};

/// Actions that change a target's power state. Only these are broadcast to
/// the cluster on success; metadata/list/status stay local.
pub fn is_power_action(action: &str) -> bool {
    matches!(action, "off" | "reboot" | "on" | "poweroff" | "poweron")
}

/// One fencing request as queued against a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceCommand {
    pub action: String,
    /// Node to act on. Absent for device-level actions like `list`.
    pub victim: Option<String>,
    pub timeout_ms: u64,
    pub origin: Origin,
    /// Correlation id chosen by the originator.
    pub id: u64,
    /// Devices still to try, in priority order. The head is the device this
    /// command is currently queued on.
    pub fallback: Vec<String>,
}

impl FenceCommand {
    pub fn new(action: &str, victim: Option<&str>, timeout_ms: u64, origin: Origin, id: u64) -> Self {
        Self {
            action: action.to_string(),
            victim: victim.map(|v| v.to_string()),
            timeout_ms,
            origin,
            id,
            fallback: Vec::new(),
        }
    }
}

/// Terminal result of a fencing command, broadcast to every peer for power
/// actions so the whole cluster converges on the target's fate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceOutcome {
    pub target: Option<String>,
    pub action: String,
    pub rc: i32,
    pub origin: Origin,
    pub id: u64,
    /// Node that ran the agent.
    pub executioner: String,
    /// Device that produced the final result, if any was usable.
    pub device: Option<String>,
}

impl FenceOutcome {
    pub fn succeeded(&self) -> bool {
        self.rc == 0
    }
}
