use crate::{
    core::PermissionIndex,
    k8s::{Api, Client, ConfigMap, ObjectMeta, Patch, PatchParams},
};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs, time};
use tracing::{debug, info};

/// The ConfigMap key under which the index is stored.
pub const LABELS_KEY: &str = "labels.yaml";

/// The file written when no other sink is configured.
pub const DEFAULT_OUTPUT: &str = "labels.yaml";

const FIELD_MANAGER: &str = "rbac-collector";
pub const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode index: {0}")]
    Encode(#[from] serde_yaml::Error),

    #[error("failed to apply ConfigMap {namespace}/{name}: {source}")]
    Api {
        namespace: String,
        name: String,
        source: kube::Error,
    },

    #[error("timed out applying ConfigMap {namespace}/{name} after {timeout:?}")]
    Timeout {
        namespace: String,
        name: String,
        timeout: time::Duration,
    },

    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Writes a permission index somewhere the gateway can read it.
#[async_trait::async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, index: &PermissionIndex) -> Result<(), Error>;
}

/// Stores the index in a ConfigMap, creating the ConfigMap if it does not exist.
#[derive(Clone)]
pub struct ConfigMapSink {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
    timeout: time::Duration,
}

/// Stores the index in a local file.
#[derive(Clone, Debug)]
pub struct FileSink {
    path: PathBuf,
}

/// Publishes to every configured sink in order.
#[derive(Default)]
pub struct Sinks(Vec<Box<dyn Publish>>);

// === impl ConfigMapSink ===

impl ConfigMapSink {
    pub fn new(client: Client, namespace: impl ToString, name: impl ToString) -> Self {
        let namespace = namespace.to_string();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.to_string(),
            timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn config_map(&self, yaml: String) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(std::iter::once((LABELS_KEY.to_string(), yaml)).collect()),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Publish for ConfigMapSink {
    async fn publish(&self, index: &PermissionIndex) -> Result<(), Error> {
        let cm = self.config_map(index.to_yaml()?);

        // Server-side apply creates the ConfigMap when it is absent and otherwise only replaces the
        // fields this manager owns.
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let apply = Patch::Apply(&cm);
        let patch = self.api.patch(&self.name, &params, &apply);
        match time::timeout(self.timeout, patch).await {
            Ok(Ok(_)) => {
                info!(namespace = %self.namespace, name = %self.name, "Updated ConfigMap");
                Ok(())
            }
            Ok(Err(source)) => Err(Error::Api {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                source,
            }),
            Err(_) => Err(Error::Timeout {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                timeout: self.timeout,
            }),
        }
    }
}

// === impl FileSink ===

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The sibling path written before being renamed over the target.
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_OUTPUT.to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}

#[async_trait::async_trait]
impl Publish for FileSink {
    async fn publish(&self, index: &PermissionIndex) -> Result<(), Error> {
        let yaml = index.to_yaml()?;
        let staging = self.staging_path();
        let io_err = |source| Error::Io {
            path: self.path.clone(),
            source,
        };

        // Readers either see the previous document or the complete new one.
        fs::write(&staging, yaml.as_bytes()).await.map_err(io_err)?;
        if let Err(error) = fs::rename(&staging, &self.path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(io_err(error));
        }

        info!(path = %self.path.display(), "Wrote index");
        Ok(())
    }
}

// === impl Sinks ===

impl Sinks {
    pub fn push(mut self, sink: impl Publish + 'static) -> Self {
        self.0.push(Box::new(sink));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait::async_trait]
impl Publish for Sinks {
    /// Every sink is attempted even if an earlier one fails; the first failure is returned.
    async fn publish(&self, index: &PermissionIndex) -> Result<(), Error> {
        let mut failure = None;
        for sink in &self.0 {
            if let Err(error) = sink.publish(index).await {
                debug!(%error, "Sink failed");
                failure.get_or_insert(error);
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> PermissionIndex {
        let mut index = PermissionIndex::default();
        index.insert_user("alice", "ns-a");
        index.insert_group("admins", crate::core::CLUSTER_WIDE);
        index
    }

    #[tokio::test]
    async fn file_sink_replaces_the_document() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let sink = FileSink::new(dir.path().join("labels.yaml"));

        sink.publish(&PermissionIndex::default())
            .await
            .expect("publish must succeed");
        sink.publish(&index()).await.expect("publish must succeed");

        let yaml = std::fs::read_to_string(sink.path()).expect("must read document");
        assert_eq!(
            PermissionIndex::from_yaml(&yaml).expect("must decode"),
            index()
        );

        // Only the target remains; the staging file was renamed away.
        let entries = std::fs::read_dir(dir.path())
            .expect("must read dir")
            .count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn file_sink_reports_io_failures() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let sink = FileSink::new(dir.path().join("missing").join("labels.yaml"));

        let err = sink
            .publish(&index())
            .await
            .expect_err("publish must fail");
        assert!(matches!(err, Error::Io { .. }), "{err}");
    }

    #[tokio::test]
    async fn sinks_attempt_every_sink() {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let good = FileSink::new(dir.path().join("labels.yaml"));
        let bad = FileSink::new(dir.path().join("missing").join("labels.yaml"));
        let sinks = Sinks::default().push(bad).push(good.clone());

        let err = sinks.publish(&index()).await.expect_err("must fail");
        assert!(matches!(err, Error::Io { ref path, .. } if path.ends_with("missing/labels.yaml")));
        assert!(good.path().exists(), "later sinks must still be written");
    }
}
