//! Brute-force verification of a resolved index.
//!
//! Rather than reading bindings, the verifier asks the API server, one `SubjectAccessReview` at a
//! time, whether each subject may perform a verb in each namespace. This is slow (subjects ×
//! namespaces requests) but independent of the resolver, so it serves as a cross-check.

use crate::{
    core::{ExclusionPolicy, PermissionIndex, Snapshot, Subject, SubjectKind},
    k8s::{
        Api, Client, PostParams, ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
    },
};
use futures::prelude::*;
use std::collections::BTreeSet;

pub const DEFAULT_VERB: &str = "get";
pub const DEFAULT_RESOURCE: &str = "pods";

/// Answers whether a subject may perform a verb on a resource in a namespace.
#[async_trait::async_trait]
pub trait AccessReview: Send + Sync {
    async fn check_access(
        &self,
        subject: &Subject,
        namespace: &str,
        verb: &str,
        resource: &str,
    ) -> Result<bool, kube::Error>;
}

/// Issues `SubjectAccessReview`s against the API server.
#[derive(Clone)]
pub struct SubjectAccessReviews {
    api: Api<SubjectAccessReview>,
}

/// What each review asks.
#[derive(Clone, Debug)]
pub struct Check {
    pub verb: String,
    pub resource: String,

    /// The maximum number of reviews in flight.
    pub concurrency: usize,
}

/// A subject whose reviewed access differs from its resolved access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discrepancy {
    pub subject: Subject,

    /// Namespaces the API server allows that the resolved index omits.
    pub missing: BTreeSet<String>,

    /// Namespaces the resolved index includes that the API server denies.
    pub unexpected: BTreeSet<String>,
}

// === impl SubjectAccessReviews ===

impl SubjectAccessReviews {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait::async_trait]
impl AccessReview for SubjectAccessReviews {
    async fn check_access(
        &self,
        subject: &Subject,
        namespace: &str,
        verb: &str,
        resource: &str,
    ) -> Result<bool, kube::Error> {
        let review = self
            .api
            .create(
                &PostParams::default(),
                &access_review(subject, namespace, verb, resource),
            )
            .await?;
        Ok(review.status.is_some_and(|status| status.allowed))
    }
}

fn access_review(
    subject: &Subject,
    namespace: &str,
    verb: &str,
    resource: &str,
) -> SubjectAccessReview {
    let (user, groups) = match subject.kind {
        SubjectKind::Group => (None, Some(vec![subject.name.clone()])),
        _ => (Some(subject.name.clone()), None),
    };
    SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user,
            groups,
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(namespace.to_string()),
                verb: Some(verb.to_string()),
                resource: Some(resource.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

// === impl Check ===

impl Default for Check {
    fn default() -> Self {
        Self {
            verb: DEFAULT_VERB.to_string(),
            resource: DEFAULT_RESOURCE.to_string(),
            concurrency: 16,
        }
    }
}

/// Lists the users and groups named by any binding that the policy doesn't exclude.
pub fn subjects(snapshot: &Snapshot, policy: &ExclusionPolicy) -> Vec<Subject> {
    snapshot
        .role_bindings
        .iter()
        .chain(&snapshot.cluster_role_bindings)
        .flat_map(|b| &b.subjects)
        .filter(|s| matches!(s.kind, SubjectKind::User | SubjectKind::Group))
        .filter(|s| !policy.excludes_subject(s))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Reviews every (subject, namespace) pair, returning the index of allowed pairs.
///
/// Fails on the first review that fails.
pub async fn review<R>(
    reviewer: &R,
    subjects: &[Subject],
    namespaces: &[String],
    check: &Check,
) -> Result<PermissionIndex, kube::Error>
where
    R: AccessReview + ?Sized,
{
    let pairs = subjects
        .iter()
        .flat_map(|s| namespaces.iter().map(move |ns| (s, ns)));
    let allowed = stream::iter(pairs)
        .map(|(subject, ns)| async move {
            let allowed = reviewer
                .check_access(subject, ns, &check.verb, &check.resource)
                .await?;
            Ok::<_, kube::Error>(allowed.then_some((subject, ns)))
        })
        .buffer_unordered(check.concurrency.max(1))
        .try_filter_map(future::ok)
        .try_collect::<Vec<_>>()
        .await?;

    let mut index = PermissionIndex::default();
    for (subject, ns) in allowed {
        index.insert(&subject.kind, &subject.name, ns);
    }
    Ok(index)
}

/// Compares a resolved index with a reviewed one over `namespaces`.
///
/// A cluster-wide entry in the resolved index stands for every namespace.
pub fn compare(
    resolved: &PermissionIndex,
    reviewed: &PermissionIndex,
    namespaces: &[String],
) -> Vec<Discrepancy> {
    let checked = namespaces.iter().cloned().collect::<BTreeSet<_>>();
    let mut discrepancies = Vec::new();
    for (kind, names) in [
        (
            SubjectKind::User,
            resolved.users.keys().chain(reviewed.users.keys()),
        ),
        (
            SubjectKind::Group,
            resolved.groups.keys().chain(reviewed.groups.keys()),
        ),
    ] {
        for name in names.collect::<BTreeSet<_>>() {
            let expected = if resolved.is_cluster_wide(&kind, name) {
                checked.clone()
            } else {
                resolved
                    .namespaces(&kind, name)
                    .map(|ns| ns.intersection(&checked).cloned().collect())
                    .unwrap_or_default()
            };
            let actual = reviewed
                .namespaces(&kind, name)
                .cloned()
                .unwrap_or_default();
            if expected == actual {
                continue;
            }
            discrepancies.push(Discrepancy {
                subject: Subject {
                    kind: kind.clone(),
                    name: name.clone(),
                },
                missing: actual.difference(&expected).cloned().collect(),
                unexpected: expected.difference(&actual).cloned().collect(),
            });
        }
    }
    discrepancies
}
