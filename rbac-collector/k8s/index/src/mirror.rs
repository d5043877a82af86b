use ahash::AHashMap as HashMap;
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use rbac_collector_core as core;
use rbac_collector_k8s_api::{self as k8s, rbac};
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};

/// A Kubernetes resource kind that can be mirrored.
///
/// Each mirrored object is converted into its collector entry once, when it is applied, so that
/// resolution never has to look at raw RBAC rules.
pub trait Mirrored:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    type Entry: Clone + fmt::Debug + Send + Sync + 'static;

    fn entry(&self) -> Self::Entry;
}

/// An in-memory replica of one resource kind.
///
/// Objects are identified by their UID, so that objects of the same name in different namespaces
/// never collide.
pub struct Mirror<T: Mirrored> {
    entries: HashMap<String, T::Entry>,

    /// The last resource version observed from a list, an applied event, or a bookmark.
    resource_version: Option<String>,
}

pub type SharedMirror<T> = Arc<RwLock<Mirror<T>>>;

// === impl Mirror ===

impl<T: Mirrored> Default for Mirror<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            resource_version: None,
        }
    }
}

impl<T: Mirrored> fmt::Debug for Mirror<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mirror")
            .field("kind", &T::kind(&()))
            .field("len", &self.entries.len())
            .field("resource_version", &self.resource_version)
            .finish()
    }
}

impl<T: Mirrored> Mirror<T> {
    pub fn shared() -> SharedMirror<T> {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Replaces the mirror's contents with a fresh list.
    pub fn reset(&mut self, items: impl IntoIterator<Item = T>, resource_version: Option<String>) {
        self.entries = items
            .into_iter()
            .map(|obj| (id(&obj), obj.entry()))
            .collect();
        self.resource_version = resource_version;
    }

    /// Inserts an object unless an object with the same identity is already present.
    pub fn added(&mut self, obj: &T) -> bool {
        self.observe(obj);
        let id = id(obj);
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, obj.entry());
        true
    }

    /// Replaces the object with the same identity. Unknown objects are ignored.
    pub fn modified(&mut self, obj: &T) -> bool {
        self.observe(obj);
        match self.entries.get_mut(&id(obj)) {
            Some(entry) => {
                *entry = obj.entry();
                true
            }
            None => false,
        }
    }

    /// Removes the object with the same identity. Unknown objects are ignored.
    pub fn deleted(&mut self, obj: &T) -> bool {
        self.observe(obj);
        self.entries.remove(&id(obj)).is_some()
    }

    pub fn observe_version(&mut self, resource_version: String) {
        self.resource_version = Some(resource_version);
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies the current entries, in no particular order.
    pub fn entries(&self) -> Vec<T::Entry> {
        self.entries.values().cloned().collect()
    }

    fn observe(&mut self, obj: &T) {
        if let Some(version) = obj.resource_version() {
            self.resource_version = Some(version);
        }
    }
}

/// Objects without a UID only exist in tests; they fall back to their namespaced name.
fn id<T: Resource>(obj: &T) -> String {
    obj.uid().unwrap_or_else(|| {
        let ns = obj.namespace().unwrap_or_default();
        format!("{ns}/{}", obj.name_any())
    })
}

// === impl Mirrored ===

impl Mirrored for k8s::Role {
    type Entry = core::Role;

    fn entry(&self) -> core::Role {
        rbac::role(self)
    }
}

impl Mirrored for k8s::ClusterRole {
    type Entry = core::Role;

    fn entry(&self) -> core::Role {
        rbac::cluster_role(self)
    }
}

impl Mirrored for k8s::RoleBinding {
    type Entry = core::Binding;

    fn entry(&self) -> core::Binding {
        rbac::role_binding(self)
    }
}

impl Mirrored for k8s::ClusterRoleBinding {
    type Entry = core::Binding;

    fn entry(&self) -> core::Binding {
        rbac::cluster_role_binding(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mk_role, rule};

    #[test]
    fn added_is_idempotent_by_uid() {
        let mut mirror = Mirror::<k8s::Role>::default();
        let role = mk_role("ns", "reader", "uid-0", &["get"]);
        assert!(mirror.added(&role));
        assert!(!mirror.added(&role));
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn same_name_in_different_namespaces() {
        let mut mirror = Mirror::<k8s::Role>::default();
        assert!(mirror.added(&mk_role("ns-a", "reader", "uid-a", &["get"])));
        assert!(mirror.added(&mk_role("ns-b", "reader", "uid-b", &["delete"])));
        assert_eq!(mirror.len(), 2);

        assert!(mirror.deleted(&mk_role("ns-a", "reader", "uid-a", &["get"])));
        assert_eq!(
            mirror.entries(),
            vec![core::Role::namespaced("ns-b", "reader", false)]
        );
    }

    #[test]
    fn modified_replaces_in_place() {
        let mut mirror = Mirror::<k8s::Role>::default();
        mirror.added(&mk_role("ns", "reader", "uid-0", &["delete"]));

        let mut role = mk_role("ns", "reader", "uid-0", &["delete"]);
        role.rules.get_or_insert_with(Vec::new).push(rule(&["list"]));
        assert!(mirror.modified(&role));
        assert_eq!(
            mirror.entries(),
            vec![core::Role::namespaced("ns", "reader", true)]
        );
    }

    #[test]
    fn unknown_objects_are_ignored() {
        let mut mirror = Mirror::<k8s::Role>::default();
        let role = mk_role("ns", "reader", "uid-0", &["get"]);
        assert!(!mirror.modified(&role));
        assert!(!mirror.deleted(&role));
        assert!(mirror.is_empty());
    }

    #[test]
    fn reset_replaces_everything() {
        let mut mirror = Mirror::<k8s::Role>::default();
        mirror.added(&mk_role("ns", "stale", "uid-0", &["get"]));
        mirror.reset(
            vec![
                mk_role("ns", "reader", "uid-1", &["get"]),
                mk_role("ns", "writer", "uid-2", &["create"]),
            ],
            Some("42".to_string()),
        );
        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.resource_version(), Some("42"));
        assert!(mirror
            .entries()
            .iter()
            .all(|role| role.name != "stale"));
    }

    #[test]
    fn events_advance_the_watermark() {
        let mut mirror = Mirror::<k8s::Role>::default();
        mirror.reset(vec![], Some("1".to_string()));

        let mut role = mk_role("ns", "reader", "uid-0", &["get"]);
        role.metadata.resource_version = Some("7".to_string());
        mirror.added(&role);
        assert_eq!(mirror.resource_version(), Some("7"));

        mirror.observe_version("9".to_string());
        assert_eq!(mirror.resource_version(), Some("9"));
    }
}
