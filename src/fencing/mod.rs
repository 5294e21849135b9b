//! Node fencing: device selection, agent scheduling, outcome broadcast

pub mod command;
pub mod coordinator;
pub mod device;

pub use command::{is_power_action, FenceCommand, FenceOutcome};
pub use coordinator::{
    ChildAgentRunner, FenceCoordinator, FenceReaction, SELF_FENCE_EXIT,
};
pub use device::{
    parse_host_map, FenceAgentRunner, FenceDevice, FenceError, HostCheck, DYNAMIC_LIST_TTL_SECS,
};
