use crate::rbac::SubjectKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The namespace value recorded for access granted by a `ClusterRoleBinding`.
pub const CLUSTER_WIDE: &str = "#cluster-wide";

/// Maps each user and group to the set of namespaces it may access.
///
/// Users and groups are tracked independently: the same name may appear in both partitions. Both
/// partitions are ordered sets, so two indexes compare equal whenever they hold the same subjects
/// and namespaces, regardless of the order in which entries were inserted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionIndex {
    #[serde(default)]
    pub users: BTreeMap<String, BTreeSet<String>>,

    #[serde(default)]
    pub groups: BTreeMap<String, BTreeSet<String>>,
}

// === impl PermissionIndex ===

impl PermissionIndex {
    /// Records that `subject` may access `namespace`.
    ///
    /// Subjects that are neither users nor groups are ignored.
    pub fn insert(&mut self, kind: &SubjectKind, subject: &str, namespace: &str) {
        let partition = match kind {
            SubjectKind::User => &mut self.users,
            SubjectKind::Group => &mut self.groups,
            SubjectKind::ServiceAccount | SubjectKind::Other(_) => return,
        };
        partition
            .entry(subject.to_string())
            .or_default()
            .insert(namespace.to_string());
    }

    pub fn insert_user(&mut self, user: &str, namespace: &str) {
        self.insert(&SubjectKind::User, user, namespace);
    }

    pub fn insert_group(&mut self, group: &str, namespace: &str) {
        self.insert(&SubjectKind::Group, group, namespace);
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }

    /// Returns true if any partition grants the subject cluster-wide access.
    pub fn is_cluster_wide(&self, kind: &SubjectKind, subject: &str) -> bool {
        self.namespaces(kind, subject)
            .is_some_and(|namespaces| namespaces.contains(CLUSTER_WIDE))
    }

    pub fn namespaces(&self, kind: &SubjectKind, subject: &str) -> Option<&BTreeSet<String>> {
        match kind {
            SubjectKind::User => self.users.get(subject),
            SubjectKind::Group => self.groups.get(subject),
            SubjectKind::ServiceAccount | SubjectKind::Other(_) => None,
        }
    }

    /// Encodes the index as the `labels.yaml` document consumed by the gateway.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}
