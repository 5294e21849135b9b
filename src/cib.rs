//! Configuration-store client
//!
//! The store itself is an external collaborator; this is the one-way seam
//! the core pushes updates through. Requests are fire-and-forget from the
//! event loop's perspective; the store applies them transactionally and
//! replicates on its own schedule. Tests drain the receiving end.

use crate::executor::history::OpRecord;
use crate::executor::op::OpKey;
use tokio::sync::mpsc;
use tracing::debug;

/// Attribute flagging that a node's resources have been probed.
pub const ATTR_PROBED: &str = "probed";
/// Timestamp attribute legacy peers watch to notice a history refresh.
pub const ATTR_LAST_REFRESH: &str = "last-refresh";

#[derive(Debug, Clone)]
pub enum CibRequest {
    /// Record one operation in a node's resource history.
    UpdateHistory {
        node: String,
        rsc: String,
        record: OpRecord,
        /// Shutdown-lock stamp accompanying the update, if held.
        lock_until: Option<u64>,
        /// Instance-parameter digest stored alongside.
        digest: Option<String>,
    },
    /// Optimistic erase keyed by (node, resource, op key, call id);
    /// a stale delete is a no-op at the store.
    EraseOp {
        node: String,
        rsc: String,
        op: OpKey,
        call_id: i64,
    },
    /// Remove a node's history wholesale (or one resource's).
    EraseHistory {
        node: String,
        rsc: Option<String>,
    },
    /// Surface a resource deletion.
    DeleteResource { node: String, rsc: String },
    /// Record a fencing outcome. Carries the quorum override so a node
    /// that just lost quorum can still record that it was fenced.
    StonithUpdate {
        target: String,
        origin: String,
        quorum_override: bool,
    },
    /// Set (or clear, with `None`) a transient node attribute.
    SetAttribute {
        node: String,
        name: String,
        value: Option<String>,
    },
}

/// Cheap-to-clone handle the subsystems hold.
#[derive(Clone)]
pub struct CibClient {
    tx: mpsc::UnboundedSender<CibRequest>,
}

impl CibClient {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CibRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn submit(&self, req: CibRequest) {
        if self.tx.send(req).is_err() {
            debug!("Configuration store handle closed; dropping update");
        }
    }

    pub fn update_history(
        &self,
        node: &str,
        rsc: &str,
        record: OpRecord,
        lock_until: Option<u64>,
        digest: Option<String>,
    ) {
        self.submit(CibRequest::UpdateHistory {
            node: node.to_string(),
            rsc: rsc.to_string(),
            record,
            lock_until,
            digest,
        });
    }

    pub fn erase_op(&self, node: &str, rsc: &str, op: OpKey, call_id: i64) {
        self.submit(CibRequest::EraseOp {
            node: node.to_string(),
            rsc: rsc.to_string(),
            op,
            call_id,
        });
    }

    pub fn erase_history(&self, node: &str, rsc: Option<&str>) {
        self.submit(CibRequest::EraseHistory {
            node: node.to_string(),
            rsc: rsc.map(|r| r.to_string()),
        });
    }

    pub fn delete_resource(&self, node: &str, rsc: &str) {
        self.submit(CibRequest::DeleteResource {
            node: node.to_string(),
            rsc: rsc.to_string(),
        });
    }

    pub fn stonith_update(&self, target: &str, origin: &str) {
        self.submit(CibRequest::StonithUpdate {
            target: target.to_string(),
            origin: origin.to_string(),
            quorum_override: true,
        });
    }

    pub fn set_attribute(&self, node: &str, name: &str, value: Option<&str>) {
        self.submit(CibRequest::SetAttribute {
            node: node.to_string(),
            name: name.to_string(),
            value: value.map(|v| v.to_string()),
        });
    }
}
