//! Peer cache with duplicate healing and reap policy

use super::node::{ClusterNode, ExpectedState, JoinPhase, Liveness, FLAG_DIRTY, FLAG_REMOTE};
use crate::types::{now, NodeId};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("lookup requires an id or a name")]
    NoCriteria,
    #[error("cache entry vanished during update")]
    EntryVanished,
    #[error("name {0} already bound to a different node")]
    NameConflict(String),
}

/// Which subset of the cache a lookup may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFilter {
    Cluster,
    Remote,
    Any,
}

impl CacheFilter {
    fn admits(self, node: &ClusterNode) -> bool {
        match self {
            CacheFilter::Cluster => !node.is_remote(),
            CacheFilter::Remote => node.is_remote(),
            CacheFilter::Any => true,
        }
    }
}

/// What changed on a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Liveness,
    Join,
    Flags,
}

pub type StatusCallback = Box<dyn FnMut(&ClusterNode, StatusKind) + Send>;

/// Owning cache of every known cluster and remote node, keyed by uuid.
/// All cross-entity navigation goes through lookup; entries hold plain
/// identifiers, never references to each other.
pub struct PeerCache {
    nodes: HashMap<String, ClusterNode>,
    autoreap: bool,
    callback: Option<StatusCallback>,
}

impl PeerCache {
    pub fn new(autoreap: bool) -> Self {
        Self {
            nodes: HashMap::new(),
            autoreap,
            callback: None,
        }
    }

    /// Install the status-change callback. Invoked on every member/lost,
    /// join-phase and flag transition, from the owning event loop only.
    pub fn set_callback(&mut self, cb: StatusCallback) {
        self.callback = Some(cb);
    }

    /// The transition engine disables auto-reap around fencing so a reap
    /// cannot race the stonith bookkeeping, then restores it.
    pub fn set_autoreap(&mut self, enabled: bool) -> bool {
        let previous = self.autoreap;
        self.autoreap = enabled;
        previous
    }

    pub fn autoreap(&self) -> bool {
        self.autoreap
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, uuid: &str) -> Option<&ClusterNode> {
        self.nodes.get(uuid)
    }

    pub fn get_by_name(&self, uname: &str) -> Option<&ClusterNode> {
        self.nodes.values().find(|n| n.uname == uname)
    }

    /// Iterate entries currently in the process group.
    pub fn active(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values().filter(|n| n.is_member())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    /// Find-or-create by bus id and/or name, healing partial entries.
    ///
    /// A peer previously known only by name gains its id the first time a
    /// message carrying the id arrives. If id and name resolve to two
    /// distinct entries for the same physical node, the newer entry absorbs
    /// the older one and the older is removed.
    pub fn lookup_or_create(
        &mut self,
        bus_id: Option<NodeId>,
        uname: Option<&str>,
        filter: CacheFilter,
    ) -> Result<&mut ClusterNode, MembershipError> {
        if bus_id.is_none() && uname.is_none() {
            return Err(MembershipError::NoCriteria);
        }

        let by_id = bus_id.and_then(|id| {
            self.nodes
                .values()
                .find(|n| n.bus_id == Some(id) && filter.admits(n))
                .map(|n| n.uuid.clone())
        });
        let by_name = uname.and_then(|name| {
            self.nodes
                .values()
                .find(|n| n.uname == name && filter.admits(n))
                .map(|n| n.uuid.clone())
        });

        let uuid = match (by_id, by_name) {
            (Some(a), Some(b)) if a == b => a,
            (Some(a), Some(b)) => self.merge(a, b)?,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                let remote = filter == CacheFilter::Remote;
                let uuid = match (bus_id, uname) {
                    (Some(id), _) if !remote => id.to_string(),
                    (_, Some(name)) => name.to_string(),
                    (Some(id), None) => id.to_string(),
                    (None, None) => return Err(MembershipError::NoCriteria),
                };
                let mut node =
                    ClusterNode::new(uuid.clone(), uname.unwrap_or_default().to_string(), bus_id);
                if remote {
                    node.flags |= FLAG_REMOTE;
                    node.bus_id = None;
                }
                debug!("Created cache entry {} (remote={})", uuid, remote);
                self.nodes.insert(uuid.clone(), node);
                uuid
            }
        };

        let node = self
            .nodes
            .get_mut(&uuid)
            .ok_or(MembershipError::EntryVanished)?;

        // Heal whatever the caller knows that the entry does not.
        if node.bus_id.is_none() && !node.is_remote() {
            if let Some(id) = bus_id {
                info!("Learned bus id {} for {}", id, node.uname);
                node.bus_id = Some(id);
            }
        }
        if node.uname.is_empty() {
            if let Some(name) = uname {
                info!("Learned name {} for node {}", name, node.uuid);
                node.uname = name.to_string();
            }
        }
        node.last_seen = now();
        Ok(node)
    }

    /// Merge two entries referring to the same physical node. Returns the
    /// uuid of the surviving entry.
    fn merge(&mut self, a: String, b: String) -> Result<String, MembershipError> {
        let (keep, drop) = {
            let na = self.nodes.get(&a).ok_or(MembershipError::EntryVanished)?;
            let nb = self.nodes.get(&b).ok_or(MembershipError::EntryVanished)?;
            // The entry seen more recently wins; ties favor the one that
            // already carries a bus id.
            if (na.last_seen, na.bus_id.is_some()) >= (nb.last_seen, nb.bus_id.is_some()) {
                (a, b)
            } else {
                (b, a)
            }
        };
        let older = self
            .nodes
            .remove(&drop)
            .ok_or(MembershipError::EntryVanished)?;
        let newer = self
            .nodes
            .get_mut(&keep)
            .ok_or(MembershipError::EntryVanished)?;
        warn!(
            "Merging duplicate cache entries {} and {} for {}",
            keep, drop, newer.uname
        );
        newer.absorb(&older);
        Ok(keep)
    }

    /// Update liveness, firing the status callback on change.
    pub fn set_liveness(&mut self, uuid: &str, liveness: Liveness) {
        if let Some(node) = self.nodes.get_mut(uuid) {
            if node.liveness != liveness {
                node.liveness = liveness;
                node.last_seen = now();
                if let Some(cb) = self.callback.as_mut() {
                    cb(node, StatusKind::Liveness);
                }
            }
        }
    }

    pub fn set_join(&mut self, uuid: &str, phase: JoinPhase) {
        if let Some(node) = self.nodes.get_mut(uuid) {
            if node.join != phase {
                node.join = phase;
                if let Some(cb) = self.callback.as_mut() {
                    cb(node, StatusKind::Join);
                }
            }
        }
    }

    pub fn set_expected(&mut self, uuid: &str, expected: ExpectedState) {
        if let Some(node) = self.nodes.get_mut(uuid) {
            node.expected = Some(expected);
        }
    }

    pub fn add_flags(&mut self, uuid: &str, flags: u32) {
        if let Some(node) = self.nodes.get_mut(uuid) {
            if node.flags & flags != flags {
                node.flags |= flags;
                if let Some(cb) = self.callback.as_mut() {
                    cb(node, StatusKind::Flags);
                }
            }
        }
    }

    /// The bus reported this id joined the process group. Remote nodes never
    /// enter `member` this way.
    pub fn process_group_joined(&mut self, bus_id: NodeId, uname: Option<&str>) {
        if let Some(name) = uname {
            if self.get_by_name(name).is_some_and(|n| n.is_remote()) {
                warn!("Bus join for remote node {} ignored", name);
                return;
            }
        }
        let uuid = match self.lookup_or_create(Some(bus_id), uname, CacheFilter::Cluster) {
            Ok(node) => node.uuid.clone(),
            Err(e) => {
                warn!("Ignoring join of bus id {}: {}", bus_id, e);
                return;
            }
        };
        self.set_liveness(&uuid, Liveness::Member);
    }

    /// The bus reported this id left the process group. The entry survives
    /// but is marked dirty and loses its join phase.
    pub fn process_group_left(&mut self, bus_id: NodeId) {
        let uuid = match self
            .nodes
            .values()
            .find(|n| n.bus_id == Some(bus_id) && !n.is_remote())
        {
            Some(n) => n.uuid.clone(),
            None => {
                debug!("Departure of unknown bus id {}", bus_id);
                return;
            }
        };
        self.set_liveness(&uuid, Liveness::Lost);
        self.set_join(&uuid, JoinPhase::None);
        self.add_flags(&uuid, FLAG_DIRTY);
    }

    /// Remove dirty non-remote entries. No-op while auto-reap is disabled.
    pub fn reap(&mut self) -> usize {
        if !self.autoreap {
            return 0;
        }
        let doomed: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.is_dirty() && !n.is_remote())
            .map(|n| n.uuid.clone())
            .collect();
        for uuid in &doomed {
            info!("Reaping departed peer {}", uuid);
            self.nodes.remove(uuid);
        }
        doomed.len()
    }

    /// Reconcile the remote-node subset against the configuration: missing
    /// entries are added, remote entries no longer configured are dropped.
    pub fn refresh_remotes(&mut self, configured: &[String]) {
        for name in configured {
            if self.get_by_name(name).is_none() {
                let mut node = ClusterNode::new(name.clone(), name.clone(), None);
                node.flags |= FLAG_REMOTE;
                info!("Adding configured remote node {}", name);
                self.nodes.insert(name.clone(), node);
            }
        }
        let stale: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.is_remote() && !configured.contains(&n.uname))
            .map(|n| n.uuid.clone())
            .collect();
        for uuid in stale {
            info!("Dropping unconfigured remote node {}", uuid);
            self.nodes.remove(&uuid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lookup_heals_missing_id() {
        let mut cache = PeerCache::new(true);
        cache
            .lookup_or_create(None, Some("node-a"), CacheFilter::Cluster)
            .unwrap();
        let node = cache
            .lookup_or_create(Some(7), Some("node-a"), CacheFilter::Cluster)
            .unwrap();
        assert_eq!(node.bus_id, Some(7));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_duplicate_entries_merge() {
        let mut cache = PeerCache::new(true);
        // Known by name first, then a bare id arrives and creates a twin.
        cache
            .lookup_or_create(None, Some("node-b"), CacheFilter::Cluster)
            .unwrap();
        cache
            .lookup_or_create(Some(9), None, CacheFilter::Cluster)
            .unwrap();
        assert_eq!(cache.len(), 2);

        let node = cache
            .lookup_or_create(Some(9), Some("node-b"), CacheFilter::Cluster)
            .unwrap();
        assert_eq!(node.bus_id, Some(9));
        assert_eq!(node.uname, "node-b");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_names_and_uuids_unique() {
        let mut cache = PeerCache::new(true);
        cache
            .lookup_or_create(Some(1), Some("n1"), CacheFilter::Cluster)
            .unwrap();
        cache
            .lookup_or_create(Some(1), Some("n1"), CacheFilter::Cluster)
            .unwrap();
        assert_eq!(cache.len(), 1);
        let names: Vec<_> = cache.iter().map(|n| n.uname.clone()).collect();
        let uuids: Vec<_> = cache.iter().map(|n| n.uuid.clone()).collect();
        assert_eq!(names.len(), 1);
        assert_eq!(uuids.len(), 1);
    }

    #[test]
    fn test_departure_marks_dirty_and_reap() {
        let mut cache = PeerCache::new(true);
        cache.process_group_joined(3, Some("n3"));
        assert!(cache.get_by_name("n3").unwrap().is_member());

        cache.process_group_left(3);
        let node = cache.get_by_name("n3").unwrap();
        assert_eq!(node.liveness, Liveness::Lost);
        assert_eq!(node.join, JoinPhase::None);
        assert!(node.is_dirty());

        assert_eq!(cache.reap(), 1);
        assert!(cache.get_by_name("n3").is_none());
    }

    #[test]
    fn test_autoreap_toggle() {
        let mut cache = PeerCache::new(true);
        cache.process_group_joined(4, Some("n4"));
        cache.process_group_left(4);

        let was = cache.set_autoreap(false);
        assert!(was);
        assert_eq!(cache.reap(), 0);
        assert!(cache.get_by_name("n4").is_some());

        cache.set_autoreap(true);
        assert_eq!(cache.reap(), 1);
    }

    #[test]
    fn test_remote_never_member_via_bus() {
        let mut cache = PeerCache::new(true);
        cache.refresh_remotes(&["guest1".to_string()]);
        let uuid = cache.get_by_name("guest1").unwrap().uuid.clone();

        // A bus join for the same name must not flip the remote entry.
        cache.process_group_joined(5, Some("guest1"));
        assert!(!cache.get(&uuid).unwrap().is_member());
    }

    #[test]
    fn test_refresh_remotes_drops_unconfigured() {
        let mut cache = PeerCache::new(true);
        cache.refresh_remotes(&["g1".to_string(), "g2".to_string()]);
        assert_eq!(cache.len(), 2);
        cache.refresh_remotes(&["g2".to_string()]);
        assert!(cache.get_by_name("g1").is_none());
        assert!(cache.get_by_name("g2").is_some());
    }

    #[test]
    fn test_status_callback_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut cache = PeerCache::new(true);
        cache.set_callback(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cache.process_group_joined(6, Some("n6"));
        let before = hits.load(Ordering::SeqCst);
        assert!(before >= 1);

        // No-op transitions stay silent.
        let uuid = cache.get_by_name("n6").unwrap().uuid.clone();
        cache.set_liveness(&uuid, Liveness::Member);
        assert_eq!(hits.load(Ordering::SeqCst), before);
    }
}
