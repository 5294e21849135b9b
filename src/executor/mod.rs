//! Per-node resource executor interface

pub mod agent;
pub mod conn;
pub mod history;
pub mod local;
pub mod op;
pub mod remote;

pub use agent::{run_agent, AgentOutcome, AgentSpec, DEVICE_ID_ENV, KILL_GRACE};
pub use conn::{CancelAck, ExecError, ExecutorBackend, ExecutorConn, NodeExecutor};
pub use history::{
    instance_params, param_digest, HistoryTable, OpRecord, RecordDisposition, ResourceHistory,
};
pub use local::{AgentRoots, LocalExecutor};
pub use op::{
    validate_rsc_id, ExecRequest, OpKey, OpKeyError, OpResult, PendingOp, PendingTable,
    RscDefinition, TransitionKey, TransitionMagic, META_PREFIX,
};
pub use remote::{
    handshake_accept, PskSource, RemoteExecutor, RemoteFrame, RemoteOp, RemotePayload,
    RemoteReplyBody, SecureStream, PSK_CACHE_SECS, REMOTE_PROTOCOL_VERSION, SYNC_CALL_CEILING,
};
