//! Host-side instance registry.
//!
//! The host application owns the instances the coordinator schedules and
//! renders them in groups. The coordinator only ever looks instances up by
//! ID and rearranges group membership; it never spawns or kills anything
//! through this seam.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

/// What the host knows about one agent instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    /// Directory the instance runs in (a worktree for attempt workers).
    pub working_dir: PathBuf,
    /// Branch the instance commits to, when it has one.
    pub branch: Option<String>,
}

/// A UI group of instances.
///
/// Sub-groups are an optional capability: `create_subgroup` returns `None`
/// on hosts whose groups cannot nest, and callers degrade gracefully.
pub trait InstanceGroup: Send + Sync {
    fn id(&self) -> String;

    fn add_instance(&self, instance_id: &str);

    /// Replace the group's direct instance list.
    fn set_instances(&self, ids: Vec<String>);

    fn instances(&self) -> Vec<String>;

    /// Create (or return the existing) sub-group with the given id.
    fn create_subgroup(&self, _id: &str, _title: &str) -> Option<Arc<dyn InstanceGroup>> {
        None
    }
}

/// Lookup surface over the host's session state.
pub trait HostSession: Send + Sync {
    /// Look up a group by its identifier.
    fn group_by_id(&self, id: &str) -> Option<Arc<dyn InstanceGroup>>;

    /// Look up the first group tagged with the given session-type kind.
    fn group_by_kind(&self, kind: &str) -> Option<Arc<dyn InstanceGroup>>;

    /// Look up an instance by its identifier.
    fn instance(&self, id: &str) -> Option<InstanceInfo>;
}

/// Content-derived group identifier, stable across re-runs.
pub fn deterministic_group_id(parent_id: &str, label: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_id.as_bytes());
    hasher.update(b"/");
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory [`InstanceGroup`] with sub-group support.
pub struct InMemoryGroup {
    id: String,
    instances: Mutex<Vec<String>>,
    subgroups: Mutex<HashMap<String, Arc<InMemoryGroup>>>,
}

impl InMemoryGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instances: Mutex::new(Vec::new()),
            subgroups: Mutex::new(HashMap::new()),
        }
    }
}

impl InstanceGroup for InMemoryGroup {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn add_instance(&self, instance_id: &str) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if !instances.iter().any(|i| i == instance_id) {
            instances.push(instance_id.to_owned());
        }
    }

    fn set_instances(&self, ids: Vec<String>) {
        *self.instances.lock().unwrap_or_else(|e| e.into_inner()) = ids;
    }

    fn instances(&self) -> Vec<String> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn create_subgroup(&self, id: &str, _title: &str) -> Option<Arc<dyn InstanceGroup>> {
        let mut subgroups = self.subgroups.lock().unwrap_or_else(|e| e.into_inner());
        let group = subgroups
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(InMemoryGroup::new(id)))
            .clone();
        Some(group)
    }
}

impl std::fmt::Debug for InMemoryGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryGroup")
            .field("id", &self.id)
            .field("instances", &self.instances())
            .finish()
    }
}

/// In-memory [`HostSession`] shared between an orchestrator implementation
/// and the coordinator.
#[derive(Default)]
pub struct InMemoryHostSession {
    groups: Mutex<HashMap<String, (String, Arc<InMemoryGroup>)>>,
    instances: Mutex<HashMap<String, InstanceInfo>>,
}

impl InMemoryHostSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return the existing) group with the given id and
    /// session-type kind tag.
    pub fn create_group(&self, id: &str, kind: &str) -> Arc<InMemoryGroup> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .entry(id.to_owned())
            .or_insert_with(|| (kind.to_owned(), Arc::new(InMemoryGroup::new(id))))
            .1
            .clone()
    }

    /// Record (or update) an instance.
    pub fn register_instance(&self, info: InstanceInfo) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.insert(info.id.clone(), info);
    }

    /// Forget an instance.
    pub fn remove_instance(&self, id: &str) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.remove(id);
    }
}

impl HostSession for InMemoryHostSession {
    fn group_by_id(&self, id: &str) -> Option<Arc<dyn InstanceGroup>> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.get(id).map(|(_, g)| g.clone() as Arc<dyn InstanceGroup>)
    }

    fn group_by_kind(&self, kind: &str) -> Option<Arc<dyn InstanceGroup>> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let mut matches: Vec<_> = groups
            .values()
            .filter(|(k, _)| k == kind)
            .map(|(_, g)| g.clone())
            .collect();
        matches.sort_by_key(|g| g.id());
        matches.into_iter().next().map(|g| g as Arc<dyn InstanceGroup>)
    }

    fn instance(&self, id: &str) -> Option<InstanceInfo> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instances.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_membership_is_deduplicated() {
        let group = InMemoryGroup::new("g1");
        group.add_instance("a");
        group.add_instance("a");
        group.add_instance("b");
        assert_eq!(group.instances(), vec!["a", "b"]);

        group.set_instances(vec![]);
        assert!(group.instances().is_empty());
    }

    #[test]
    fn subgroup_creation_is_idempotent() {
        let group = InMemoryGroup::new("parent");
        let first = group.create_subgroup("sub", "Implementers").unwrap();
        first.add_instance("x");
        let second = group.create_subgroup("sub", "Implementers").unwrap();
        assert_eq!(second.instances(), vec!["x"]);
    }

    #[test]
    fn session_lookup_by_id_and_kind() {
        let session = InMemoryHostSession::new();
        session.create_group("g1", "tripleshot");
        session.create_group("g2", "other");

        assert!(session.group_by_id("g1").is_some());
        assert!(session.group_by_id("missing").is_none());
        assert_eq!(session.group_by_kind("tripleshot").unwrap().id(), "g1");
        assert!(session.group_by_kind("unknown").is_none());
    }

    #[test]
    fn instance_registration_round_trip() {
        let session = InMemoryHostSession::new();
        session.register_instance(InstanceInfo {
            id: "inst-1".to_string(),
            working_dir: PathBuf::from("/tmp/wt"),
            branch: Some("b".to_string()),
        });

        let info = session.instance("inst-1").unwrap();
        assert_eq!(info.branch.as_deref(), Some("b"));
        session.remove_instance("inst-1");
        assert!(session.instance("inst-1").is_none());
    }

    #[test]
    fn deterministic_group_ids_are_stable_and_distinct() {
        let a = deterministic_group_id("session-1", "implementers");
        let b = deterministic_group_id("session-1", "implementers");
        let c = deterministic_group_id("session-2", "implementers");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
