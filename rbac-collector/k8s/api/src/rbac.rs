//! Conversions from the Kubernetes RBAC resources into collector entries.

use k8s_openapi::api::rbac::v1 as rbacv1;
use kube::ResourceExt;
use rbac_collector_core as core;

pub fn role(role: &rbacv1::Role) -> core::Role {
    core::Role {
        name: role.name_any(),
        namespace: Some(role.namespace().unwrap_or_default()),
        grants_access: grants_access(role.rules.as_deref()),
    }
}

pub fn cluster_role(role: &rbacv1::ClusterRole) -> core::Role {
    core::Role {
        name: role.name_any(),
        namespace: None,
        grants_access: grants_access(role.rules.as_deref()),
    }
}

pub fn role_binding(rb: &rbacv1::RoleBinding) -> core::Binding {
    core::Binding {
        name: rb.name_any(),
        namespace: Some(rb.namespace().unwrap_or_default()),
        role_ref: role_ref(&rb.role_ref),
        subjects: subjects(rb.subjects.as_deref()),
    }
}

pub fn cluster_role_binding(crb: &rbacv1::ClusterRoleBinding) -> core::Binding {
    core::Binding {
        name: crb.name_any(),
        namespace: None,
        role_ref: role_ref(&crb.role_ref),
        subjects: subjects(crb.subjects.as_deref()),
    }
}

fn grants_access(rules: Option<&[rbacv1::PolicyRule]>) -> bool {
    core::rbac::grants_access(
        rules
            .unwrap_or_default()
            .iter()
            .map(|rule| rule.verbs.iter().map(String::as_str)),
    )
}

fn role_ref(role_ref: &rbacv1::RoleRef) -> core::RoleRef {
    core::RoleRef {
        kind: role_ref.kind.clone(),
        name: role_ref.name.clone(),
    }
}

fn subjects(subjects: Option<&[rbacv1::Subject]>) -> Vec<core::Subject> {
    subjects
        .unwrap_or_default()
        .iter()
        .map(|s| core::Subject {
            kind: core::SubjectKind::from(s.kind.as_str()),
            name: s.name.clone(),
        })
        .collect()
}
