//! RBAC mirrors
//!
//! Maintains an in-memory replica of each RBAC resource kind. A [`Reflector`] lists a kind and then
//! watches it, applying every event to that kind's [`Mirror`] and signaling [`Changes`] so that a
//! single consumer can recompute the permission index.
//!
//! ```text
//! [ list ] -> [ watch ] -> [ Mirror ] --signal--> [ Changes ] --> [ Mirrors::snapshot ]
//! ```
//!
//! Mirrors are only ever written by their own reflector. Readers take a [`Mirrors::snapshot`], which
//! holds every mirror's read lock at once so that no collection is observed mid-update.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod changes;
pub mod metrics;
mod mirror;
pub mod reflector;

#[cfg(test)]
mod tests;

pub use self::{
    changes::Changes,
    metrics::{KindMetrics, MirrorMetrics},
    mirror::{Mirror, Mirrored, SharedMirror},
    reflector::{ListWatch, Reflector},
};
use rbac_collector_core::Snapshot;
use rbac_collector_k8s_api as k8s;

/// The mirrors of all four RBAC resource kinds.
#[derive(Clone, Debug, Default)]
pub struct Mirrors {
    pub roles: SharedMirror<k8s::Role>,
    pub cluster_roles: SharedMirror<k8s::ClusterRole>,
    pub role_bindings: SharedMirror<k8s::RoleBinding>,
    pub cluster_role_bindings: SharedMirror<k8s::ClusterRoleBinding>,
}

// === impl Mirrors ===

impl Mirrors {
    /// Copies every mirror's entries.
    ///
    /// All four read locks are held while copying, so a reflector cannot apply an event to one
    /// collection between the copies of two others.
    pub fn snapshot(&self) -> Snapshot {
        let roles = self.roles.read();
        let cluster_roles = self.cluster_roles.read();
        let role_bindings = self.role_bindings.read();
        let cluster_role_bindings = self.cluster_role_bindings.read();

        Snapshot {
            roles: roles.entries(),
            cluster_roles: cluster_roles.entries(),
            role_bindings: role_bindings.entries(),
            cluster_role_bindings: cluster_role_bindings.entries(),
        }
    }

    /// Indicates whether every mirror is empty.
    pub fn is_empty(&self) -> bool {
        self.roles.read().is_empty()
            && self.cluster_roles.read().is_empty()
            && self.role_bindings.read().is_empty()
            && self.cluster_role_bindings.read().is_empty()
    }
}
