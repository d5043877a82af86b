/// Verbs treated as conferring real access to a namespace.
pub const MEANINGFUL_VERBS: [&str; 13] = [
    "*",
    "approve",
    "create",
    "edit",
    "escalate",
    "get",
    "impersonate",
    "list",
    "patch",
    "update",
    "use",
    "view",
    "watch",
];

/// A `Role` or `ClusterRole`, reduced to whether it grants meaningful access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub name: String,

    /// `None` for cluster roles.
    pub namespace: Option<String>,

    pub grants_access: bool,
}

/// A `RoleBinding` or `ClusterRoleBinding`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub name: String,

    /// `None` for cluster role bindings.
    pub namespace: Option<String>,

    pub role_ref: RoleRef,

    /// Subjects in the order the binding lists them. Duplicates are kept.
    pub subjects: Vec<Subject>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleRef {
    /// Either `Role` or `ClusterRole`.
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
    Other(String),
}

/// Returns true if any verb of any rule is in [`MEANINGFUL_VERBS`].
pub fn grants_access<'r, R, V>(rules: R) -> bool
where
    R: IntoIterator<Item = V>,
    V: IntoIterator<Item = &'r str>,
{
    rules
        .into_iter()
        .any(|verbs| verbs.into_iter().any(is_meaningful))
}

pub fn is_meaningful(verb: &str) -> bool {
    MEANINGFUL_VERBS.contains(&verb)
}

// === impl Role ===

impl Role {
    pub fn namespaced(
        namespace: impl Into<String>,
        name: impl Into<String>,
        grants_access: bool,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            grants_access,
        }
    }

    pub fn cluster(name: impl Into<String>, grants_access: bool) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            grants_access,
        }
    }
}

// === impl RoleRef ===

impl RoleRef {
    pub const ROLE: &'static str = "Role";
    pub const CLUSTER_ROLE: &'static str = "ClusterRole";

    pub fn role(name: impl Into<String>) -> Self {
        Self {
            kind: Self::ROLE.to_string(),
            name: name.into(),
        }
    }

    pub fn cluster_role(name: impl Into<String>) -> Self {
        Self {
            kind: Self::CLUSTER_ROLE.to_string(),
            name: name.into(),
        }
    }

    pub fn is_role(&self) -> bool {
        self.kind == Self::ROLE
    }
}

// === impl Subject ===

impl Subject {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::User,
            name: name.into(),
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Group,
            name: name.into(),
        }
    }

    pub fn service_account(name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::ServiceAccount,
            name: name.into(),
        }
    }
}

// === impl SubjectKind ===

impl From<&str> for SubjectKind {
    fn from(kind: &str) -> Self {
        match kind {
            "User" => Self::User,
            "Group" => Self::Group,
            "ServiceAccount" => Self::ServiceAccount,
            other => Self::Other(other.to_string()),
        }
    }
}
