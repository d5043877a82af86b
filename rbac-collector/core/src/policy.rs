use crate::rbac::{Subject, SubjectKind};

/// Decides which subjects and namespaces never appear in a [`crate::PermissionIndex`].
///
/// A single policy is shared by every mode of the collector so that the resolver and the access
/// review verifier agree on what is excluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExclusionPolicy {
    /// Namespaces whose role bindings are ignored.
    pub namespaces: Vec<String>,

    /// Namespace name prefixes whose role bindings are ignored.
    pub namespace_prefixes: Vec<String>,

    /// Subjects whose name contains any of these substrings are ignored.
    pub subject_substrings: Vec<String>,
}

pub const DEFAULT_EXCLUDED_NAMESPACE: &str = "openshift-console-user-settings";
pub const DEFAULT_EXCLUDED_SUBJECT_SUBSTRING: &str = "system";

// === impl ExclusionPolicy ===

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self {
            namespaces: vec![DEFAULT_EXCLUDED_NAMESPACE.to_string()],
            namespace_prefixes: vec![],
            subject_substrings: vec![DEFAULT_EXCLUDED_SUBJECT_SUBSTRING.to_string()],
        }
    }
}

impl ExclusionPolicy {
    /// Service accounts are always excluded.
    pub fn excludes_subject(&self, subject: &Subject) -> bool {
        subject.kind == SubjectKind::ServiceAccount
            || self
                .subject_substrings
                .iter()
                .any(|s| subject.name.contains(s.as_str()))
    }

    pub fn excludes_namespace(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|ns| ns == namespace)
            || self
                .namespace_prefixes
                .iter()
                .any(|prefix| namespace.starts_with(prefix.as_str()))
    }
}
