pub mod cib;
pub mod config;
pub mod executor;
pub mod fencing;
pub mod membership;
pub mod messaging;
pub mod transition;
pub mod types;

pub use cib::{CibClient, CibRequest};
pub use config::CoreConfig;
pub use executor::{ExecutorConn, LocalExecutor, NodeExecutor, RemoteExecutor};
pub use fencing::{FenceCoordinator, FenceDevice, HostCheck};
pub use membership::PeerCache;
pub use messaging::{ClusterMsg, Outbox};
pub use transition::{GraphSpec, TransitionEngine};
pub use types::*;
