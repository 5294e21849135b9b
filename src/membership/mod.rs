//! Canonical node identity and membership state

pub mod cache;
pub mod node;

pub use cache::{CacheFilter, MembershipError, PeerCache, StatusCallback, StatusKind};
pub use node::{ClusterNode, ExpectedState, JoinPhase, Liveness, FLAG_DIRTY, FLAG_REMOTE};
