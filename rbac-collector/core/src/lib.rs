//! RBAC collector core
//!
//! Derives, from a cluster's RBAC objects, which users and groups may access which namespaces.
//! The types in this crate are independent of the Kubernetes API: the mirrors translate each
//! watched `Role`, `ClusterRole`, `RoleBinding`, and `ClusterRoleBinding` into the entries defined
//! here, and [`resolve`] turns a snapshot of those entries into a [`PermissionIndex`].
//!
//! ```text
//! [ Role ] [ ClusterRole ] <- [ RoleBinding ] [ ClusterRoleBinding ] -> [ Subject ]
//! ```
//!
//! Resolution is total: dangling role references, empty collections, and unknown subject kinds all
//! contribute nothing rather than failing.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod policy;
pub mod rbac;
mod resolve;

pub use self::{
    index::{PermissionIndex, CLUSTER_WIDE},
    policy::{ExclusionPolicy, DEFAULT_EXCLUDED_NAMESPACE, DEFAULT_EXCLUDED_SUBJECT_SUBSTRING},
    rbac::{Binding, Role, RoleRef, Subject, SubjectKind},
    resolve::{resolve, Snapshot},
};
