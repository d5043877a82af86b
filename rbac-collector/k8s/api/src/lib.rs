#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod rbac;

pub use k8s_openapi::api::{
    self,
    authorization::v1::{
        ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
        SubjectAccessReviewStatus,
    },
    core::v1::{ConfigMap, Namespace},
    rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
pub use kube::{
    api::{
        Api, ListParams, ObjectList, ObjectMeta, Patch, PatchParams, PostParams, WatchEvent,
        WatchParams,
    },
    core::ErrorResponse,
    Client, Error, Resource, ResourceExt,
};
