//! Shared identifiers, clocks and result codes

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Numeric node id assigned by the cluster message bus.
pub type NodeId = u32;

/// Current time as epoch seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resource-agent exit codes (OCF numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecRc {
    Ok,
    Error,
    InvalidParam,
    Unimplemented,
    InsufficientPriv,
    NotInstalled,
    NotConfigured,
    NotRunning,
    RunningPromoted,
    FailedPromoted,
    UnknownError,
}

impl ExecRc {
    pub fn code(self) -> i32 {
        match self {
            ExecRc::Ok => 0,
            ExecRc::Error => 1,
            ExecRc::InvalidParam => 2,
            ExecRc::Unimplemented => 3,
            ExecRc::InsufficientPriv => 4,
            ExecRc::NotInstalled => 5,
            ExecRc::NotConfigured => 6,
            ExecRc::NotRunning => 7,
            ExecRc::RunningPromoted => 8,
            ExecRc::FailedPromoted => 9,
            ExecRc::UnknownError => 193,
        }
    }

    /// Map a raw agent exit code. Unknown codes collapse to `UnknownError`.
    pub fn from_exit(code: i32) -> Self {
        match code {
            0 => ExecRc::Ok,
            1 => ExecRc::Error,
            2 => ExecRc::InvalidParam,
            3 => ExecRc::Unimplemented,
            4 => ExecRc::InsufficientPriv,
            5 => ExecRc::NotInstalled,
            6 => ExecRc::NotConfigured,
            7 => ExecRc::NotRunning,
            8 => ExecRc::RunningPromoted,
            9 => ExecRc::FailedPromoted,
            _ => ExecRc::UnknownError,
        }
    }
}

/// Executor-level disposition of an operation, orthogonal to the agent rc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Pending,
    Done,
    Cancelled,
    Timeout,
    NotSupported,
    Error,
    NotConnected,
    Invalid,
}

impl OpStatus {
    pub fn code(self) -> i32 {
        match self {
            OpStatus::Pending => -1,
            OpStatus::Done => 0,
            OpStatus::Cancelled => 1,
            OpStatus::Timeout => 2,
            OpStatus::NotSupported => 3,
            OpStatus::Error => 4,
            OpStatus::NotConnected => 5,
            OpStatus::Invalid => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => OpStatus::Pending,
            0 => OpStatus::Done,
            1 => OpStatus::Cancelled,
            2 => OpStatus::Timeout,
            3 => OpStatus::NotSupported,
            4 => OpStatus::Error,
            5 => OpStatus::NotConnected,
            6 => OpStatus::Invalid,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        self == OpStatus::Done
    }
}

/// Outer controller state machine. Transition aborts are only honored while
/// this node is the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    Pending,
    NotDc,
    Halt,
    Stopping,
    Terminate,
    Illegal,
    Idle,
    Policy,
    Transition,
}

impl ControllerState {
    pub fn is_leader(self) -> bool {
        matches!(
            self,
            ControllerState::Idle | ControllerState::Policy | ControllerState::Transition
        )
    }
}

/// Where a fencing request came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Peer(String),
    LocalClient(String),
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Peer(name) => write!(f, "peer {}", name),
            Origin::LocalClient(id) => write!(f, "client {}", id),
        }
    }
}
