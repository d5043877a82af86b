use crate::{
    index::{PermissionIndex, CLUSTER_WIDE},
    policy::ExclusionPolicy,
    rbac::{Binding, Role, RoleRef},
};
use ahash::AHashMap as HashMap;

/// A consistent copy of the four mirrored RBAC collections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub roles: Vec<Role>,
    pub cluster_roles: Vec<Role>,
    pub role_bindings: Vec<Binding>,
    pub cluster_role_bindings: Vec<Binding>,
}

/// Whether each known role grants access, keyed for binding lookups.
#[derive(Debug, Default)]
struct Grants<'s> {
    /// Namespaced roles, keyed by `(namespace, name)`.
    roles: HashMap<(&'s str, &'s str), bool>,

    /// Cluster roles, keyed by name. Role bindings in every namespace may reference these.
    cluster_roles: HashMap<&'s str, bool>,
}

/// Computes the permission index for a snapshot.
///
/// Resolution never fails: bindings that reference unknown roles, roles that grant nothing, and
/// excluded subjects or namespaces simply contribute no entries.
pub fn resolve(snapshot: &Snapshot, policy: &ExclusionPolicy) -> PermissionIndex {
    let grants = Grants::new(snapshot);
    let mut index = PermissionIndex::default();

    for rb in &snapshot.role_bindings {
        let Some(namespace) = rb.namespace.as_deref() else {
            continue;
        };
        if policy.excludes_namespace(namespace) || !grants.role_binding(namespace, &rb.role_ref) {
            continue;
        }
        for subject in &rb.subjects {
            if policy.excludes_subject(subject) {
                continue;
            }
            index.insert(&subject.kind, &subject.name, namespace);
        }
    }

    for crb in &snapshot.cluster_role_bindings {
        if !grants.cluster_role(&crb.role_ref.name) {
            continue;
        }
        for subject in &crb.subjects {
            if policy.excludes_subject(subject) {
                continue;
            }
            index.insert(&subject.kind, &subject.name, CLUSTER_WIDE);
        }
    }

    index
}

// === impl Snapshot ===

impl Snapshot {
    pub fn resolve(&self, policy: &ExclusionPolicy) -> PermissionIndex {
        resolve(self, policy)
    }
}

// === impl Grants ===

impl<'s> Grants<'s> {
    fn new(snapshot: &'s Snapshot) -> Self {
        let roles = snapshot
            .roles
            .iter()
            .filter_map(|role| {
                let ns = role.namespace.as_deref()?;
                Some(((ns, role.name.as_str()), role.grants_access))
            })
            .collect();
        let cluster_roles = snapshot
            .cluster_roles
            .iter()
            .map(|role| (role.name.as_str(), role.grants_access))
            .collect();
        Self {
            roles,
            cluster_roles,
        }
    }

    /// A role binding may reference a role in its own namespace or any cluster role.
    fn role_binding(&self, namespace: &'s str, role_ref: &'s RoleRef) -> bool {
        if role_ref.is_role() {
            return self
                .roles
                .get(&(namespace, role_ref.name.as_str()))
                .copied()
                .unwrap_or(false);
        }
        self.cluster_role(&role_ref.name)
    }

    fn cluster_role(&self, name: &str) -> bool {
        self.cluster_roles.get(name).copied().unwrap_or(false)
    }
}
