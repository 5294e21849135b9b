//! Runtime configuration for the controller core

use std::path::PathBuf;

/// Default per-trigger dispatch limit when the graph does not set one.
pub const DEFAULT_BATCH_LIMIT: u32 = 30;

/// Debounce before recomputing after an abort lands on a completed graph (ms).
pub const DEFAULT_RECOMPUTE_DEBOUNCE_MS: u64 = 2_000;

/// Default TCP port of the remote executor daemon.
pub const DEFAULT_REMOTE_PORT: u16 = 3121;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Human-readable name of this node.
    pub uname: String,
    /// Stable identifier of this node.
    pub uuid: String,
    /// Numeric id on the message bus, if joined.
    pub node_id: Option<crate::types::NodeId>,
    /// Upper bound on actions dispatched per trigger.
    pub batch_limit: u32,
    /// Debounce for post-completion aborts (ms).
    pub recompute_debounce_ms: u64,
    /// Pre-shared key for remote executor connections.
    pub psk_path: PathBuf,
    /// Fallback key location.
    pub psk_fallback_path: PathBuf,
    /// Port remote executors listen on.
    pub remote_port: u16,
    /// Reap lost non-remote peers automatically.
    pub autoreap: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            uname: String::new(),
            uuid: String::new(),
            node_id: None,
            batch_limit: DEFAULT_BATCH_LIMIT,
            recompute_debounce_ms: DEFAULT_RECOMPUTE_DEBOUNCE_MS,
            psk_path: PathBuf::from("/etc/regent/authkey"),
            psk_fallback_path: PathBuf::from("/etc/regent/authkey.fallback"),
            remote_port: DEFAULT_REMOTE_PORT,
            autoreap: true,
        }
    }
}
