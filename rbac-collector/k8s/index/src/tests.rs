use super::*;
use crate::reflector::{Config, Error, EventStream, WatchEnd};
use futures::prelude::*;
use k8s::{ErrorResponse, ObjectMeta, PolicyRule, WatchEvent};
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use rbac_collector_core as collector;
use std::{collections::VecDeque, io, sync::Arc};
use tokio::{sync::oneshot, time};
use tokio_test::{assert_pending, assert_ready, task};

pub(crate) fn mk_role(ns: &str, name: &str, uid: &str, verbs: &[&str]) -> k8s::Role {
    k8s::Role {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        rules: Some(vec![rule(verbs)]),
    }
}

pub(crate) fn rule(verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// A list/watch client that replays a script of list results and watch streams.
///
/// Once the script's lists are exhausted, further lists never complete. Once its watches are
/// exhausted, further watches close immediately.
#[derive(Clone)]
struct FakeApi<T>(Arc<Script<T>>);

struct Script<T> {
    lists: Mutex<VecDeque<Result<(Vec<T>, Option<String>), kube::Error>>>,
    watches: Mutex<VecDeque<Vec<Result<WatchEvent<T>, kube::Error>>>>,
    watched: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl<T: Mirrored> ListWatch<T> for FakeApi<T> {
    async fn list(&self) -> Result<(Vec<T>, Option<String>), kube::Error> {
        let next = self.0.lists.lock().pop_front();
        match next {
            Some(res) => res,
            None => future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<T>, kube::Error> {
        self.0.watched.lock().push(resource_version.to_string());
        let events = self.0.watches.lock().pop_front().unwrap_or_default();
        Ok(stream::iter(events).boxed())
    }
}

impl<T> FakeApi<T> {
    fn new() -> Self {
        Self(Arc::new(Script {
            lists: Default::default(),
            watches: Default::default(),
            watched: Default::default(),
        }))
    }

    fn list(self, items: Vec<T>, version: &str) -> Self {
        self.0
            .lists
            .lock()
            .push_back(Ok((items, Some(version.to_string()))));
        self
    }

    fn list_err(self) -> Self {
        self.0.lists.lock().push_back(Err(transport_error()));
        self
    }

    fn watch(self, events: Vec<Result<WatchEvent<T>, kube::Error>>) -> Self {
        self.0.watches.lock().push_back(events);
        self
    }

    fn watched(&self) -> Vec<String> {
        self.0.watched.lock().clone()
    }
}

fn transport_error() -> kube::Error {
    kube::Error::ReadEvents(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
}

fn malformed() -> kube::Error {
    kube::Error::SerdeError(serde_json::from_str::<serde_json::Value>("{").unwrap_err())
}

fn error_event<T>(code: u16) -> WatchEvent<T> {
    let rsp: ErrorResponse = serde_json::from_value(serde_json::json!({
        "status": "Failure",
        "message": "watch failed",
        "reason": "Testing",
        "code": code,
    }))
    .expect("error response must deserialize");
    WatchEvent::Error(rsp)
}

fn mk_reflector(
    api: &FakeApi<k8s::Role>,
    changes: &Changes,
) -> (SharedMirror<k8s::Role>, Reflector<k8s::Role, FakeApi<k8s::Role>>) {
    let mirror = Mirror::shared();
    let metrics = MirrorMetrics::register(&mut Registry::default()).kind("Role");
    let reflector = Reflector::new(
        api.clone(),
        mirror.clone(),
        changes.clone(),
        metrics,
        Config::default(),
    );
    (mirror, reflector)
}

fn entries(mirror: &SharedMirror<k8s::Role>) -> Vec<collector::Role> {
    let mut entries = mirror.read().entries();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

fn names(mirror: &SharedMirror<k8s::Role>) -> Vec<String> {
    entries(mirror).into_iter().map(|r| r.name).collect()
}

#[tokio::test]
async fn relists_after_the_watch_closes() {
    let r1 = mk_role("ns", "r1", "uid-1", &["get"]);
    let r2 = mk_role("ns", "r2", "uid-2", &["get"]);
    let r3 = mk_role("ns", "r3", "uid-3", &["get"]);
    let r4 = mk_role("ns", "r4", "uid-4", &["delete"]);
    let r4_updated = mk_role("ns", "r4", "uid-4", &["list"]);

    let api = FakeApi::new()
        .list(vec![r1.clone(), r2.clone()], "1")
        .watch(vec![
            Ok(WatchEvent::Added(r3.clone())),
            // Replayed events must not duplicate entries.
            Ok(WatchEvent::Added(r1.clone())),
            Ok(WatchEvent::Deleted(r2)),
        ])
        // r4 was created while no watch was open; it is only visible in the relist.
        .list(vec![r1, r3, r4], "10")
        .watch(vec![Ok(WatchEvent::Modified(r4_updated))]);
    let changes = Changes::default();
    let (mirror, mut reflector) = mk_reflector(&api, &changes);

    let end = reflector.sync_once().await.expect("sync must succeed");
    assert_eq!(end, WatchEnd::Closed);
    assert_eq!(names(&mirror), vec!["r1", "r3"]);

    let end = reflector.sync_once().await.expect("sync must succeed");
    assert_eq!(end, WatchEnd::Closed);
    assert_eq!(names(&mirror), vec!["r1", "r3", "r4"]);
    assert!(entries(&mirror)[2].grants_access);

    assert_eq!(api.watched(), vec!["1", "10"]);
}

#[tokio::test]
async fn applied_events_signal_changes() {
    let api = FakeApi::new()
        .list(vec![], "1")
        .watch(vec![Ok(WatchEvent::Added(mk_role(
            "ns", "r1", "uid-1", &["get"],
        )))]);
    let changes = Changes::default();
    let (_mirror, mut reflector) = mk_reflector(&api, &changes);

    reflector.sync_once().await.expect("sync must succeed");

    // The list and the event coalesce into a single pending change.
    assert_ready!(task::spawn(changes.changed()).poll());
    assert_pending!(task::spawn(changes.changed()).poll());
}

#[tokio::test]
async fn bookmarks_advance_the_watermark() {
    let bookmark = serde_json::from_value(serde_json::json!({
        "type": "BOOKMARK",
        "object": {
            "kind": "Role",
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "metadata": { "resourceVersion": "12" },
        },
    }))
    .expect("bookmark must deserialize");
    let api = FakeApi::new().list(vec![], "1").watch(vec![Ok(bookmark)]);
    let changes = Changes::default();
    let (mirror, mut reflector) = mk_reflector(&api, &changes);

    reflector.sync_once().await.expect("sync must succeed");
    assert_eq!(mirror.read().resource_version(), Some("12"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn error_events_are_retried_on_the_same_watch() {
    let api = FakeApi::new().list(vec![], "1").watch(vec![
        Ok(error_event(500)),
        Ok(error_event(500)),
        Ok(WatchEvent::Added(mk_role("ns", "r1", "uid-1", &["get"]))),
    ]);
    let changes = Changes::default();
    let (mirror, mut reflector) = mk_reflector(&api, &changes);

    let start = time::Instant::now();
    let end = reflector.sync_once().await.expect("sync must succeed");
    assert_eq!(end, WatchEnd::Closed);
    assert!(start.elapsed() >= crate::reflector::ERROR_RETRY_DELAY * 2);
    assert_eq!(names(&mirror), vec!["r1"]);
    assert_eq!(api.watched(), vec!["1"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn repeated_error_events_end_the_watch() {
    let events = (0..=crate::reflector::MAX_ERROR_RETRIES)
        .map(|_| Ok(error_event(500)))
        .collect();
    let api = FakeApi::new().list(vec![], "1").watch(events);
    let changes = Changes::default();
    let (_mirror, mut reflector) = mk_reflector(&api, &changes);

    let end = reflector.sync_once().await.expect("sync must succeed");
    assert_eq!(end, WatchEnd::Errors);
}

#[tokio::test]
async fn expired_versions_end_the_watch() {
    let api = FakeApi::new().list(vec![], "1").watch(vec![
        Ok(error_event(410)),
        Ok(WatchEvent::Added(mk_role("ns", "r1", "uid-1", &["get"]))),
    ]);
    let changes = Changes::default();
    let (mirror, mut reflector) = mk_reflector(&api, &changes);

    let end = reflector.sync_once().await.expect("sync must succeed");
    assert_eq!(end, WatchEnd::Expired);
    assert!(mirror.read().is_empty());
}

#[tokio::test]
async fn malformed_events_are_dropped() {
    let api = FakeApi::new().list(vec![], "1").watch(vec![
        Err(malformed()),
        Ok(WatchEvent::Added(mk_role("ns", "r1", "uid-1", &["get"]))),
    ]);
    let changes = Changes::default();
    let (mirror, mut reflector) = mk_reflector(&api, &changes);

    let end = reflector.sync_once().await.expect("sync must succeed");
    assert_eq!(end, WatchEnd::Closed);
    assert_eq!(names(&mirror), vec!["r1"]);
}

#[tokio::test]
async fn first_list_failure_is_fatal() {
    let api = FakeApi::<k8s::Role>::new().list_err();
    let changes = Changes::default();
    let (_mirror, reflector) = mk_reflector(&api, &changes);
    let (synced_tx, synced_rx) = oneshot::channel();

    let res = reflector.with_synced(synced_tx).run().await;
    assert!(matches!(res, Err(Error::List { .. })), "{res:?}");
    assert!(synced_rx.await.is_err(), "must not report sync");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn later_failures_are_retried() {
    let api = FakeApi::new()
        .list(vec![], "1")
        .watch(vec![Err(transport_error())])
        .list_err()
        .list(vec![mk_role("ns", "r1", "uid-1", &["get"])], "5");
    let changes = Changes::default();
    let (mirror, reflector) = mk_reflector(&api, &changes);
    let (synced_tx, synced_rx) = oneshot::channel();

    // The script ends with a list that never completes, so the reflector runs until timed out.
    let res = time::timeout(
        time::Duration::from_secs(120),
        reflector.with_synced(synced_tx).run(),
    )
    .await;
    assert!(res.is_err(), "reflector must keep running: {res:?}");
    assert!(synced_rx.await.is_ok());
    assert_eq!(names(&mirror), vec!["r1"]);
    assert_eq!(api.watched(), vec!["1", "5"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn empty_watches_back_off_before_relisting() {
    let api = FakeApi::new()
        .list(vec![], "1")
        .watch(vec![])
        .list(vec![], "2")
        .watch(vec![])
        .list(vec![], "3")
        .watch(vec![Ok(WatchEvent::Added(mk_role("ns", "r1", "uid-1", &["get"])))])
        .list(vec![], "4");
    let changes = Changes::default();
    let (mirror, reflector) = mk_reflector(&api, &changes);
    let version = || mirror.read().resource_version().map(String::from);
    let task = tokio::spawn(reflector.run());

    // Each watch that closes without delivering anything doubles the delay before the next list.
    time::sleep(time::Duration::from_millis(500)).await;
    assert_eq!(version().as_deref(), Some("1"));
    time::sleep(time::Duration::from_secs(1)).await;
    assert_eq!(version().as_deref(), Some("2"));
    time::sleep(time::Duration::from_secs(1)).await;
    assert_eq!(version().as_deref(), Some("2"));

    // The third watch applies an event, so the reflector relists without waiting.
    time::sleep(time::Duration::from_secs(1)).await;
    assert_eq!(version().as_deref(), Some("4"));
    assert_eq!(names(&mirror), Vec::<String>::new());
    assert_eq!(api.watched(), vec!["1", "2", "3", "4"]);

    task.abort();
}

#[test]
fn snapshots_copy_every_mirror() {
    let mirrors = Mirrors::default();
    assert!(mirrors.is_empty());

    mirrors
        .roles
        .write()
        .added(&mk_role("ns", "reader", "uid-0", &["get"]));
    mirrors.role_bindings.write().added(&k8s::RoleBinding {
        metadata: ObjectMeta {
            namespace: Some("ns".to_string()),
            name: Some("rb".to_string()),
            uid: Some("uid-1".to_string()),
            ..Default::default()
        },
        role_ref: k8s::api::rbac::v1::RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: "reader".to_string(),
        },
        subjects: Some(vec![k8s::api::rbac::v1::Subject {
            kind: "User".to_string(),
            name: "alice".to_string(),
            ..Default::default()
        }]),
    });

    let snapshot = mirrors.snapshot();
    assert_eq!(
        snapshot.roles,
        vec![collector::Role::namespaced("ns", "reader", true)]
    );
    assert_eq!(snapshot.role_bindings.len(), 1);
    assert!(snapshot.cluster_roles.is_empty());
    assert!(snapshot.cluster_role_bindings.is_empty());

    let index = snapshot.resolve(&collector::ExclusionPolicy::default());
    assert_eq!(
        index.namespaces(&collector::SubjectKind::User, "alice"),
        Some(&maplit::btreeset! {"ns".to_string()})
    );
}
