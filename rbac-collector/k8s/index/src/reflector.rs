use crate::{
    changes::Changes,
    metrics::KindMetrics,
    mirror::{Mirror, Mirrored, SharedMirror},
};
use futures::{prelude::*, stream::BoxStream};
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    ResourceExt,
};
use thiserror::Error;
use tokio::{sync::oneshot, time};
use tracing::{debug, info, warn};

/// Limits the amount of time a watch can be idle before being reset.
///
/// Must be less than 295 or Kubernetes throws an error.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub const ERROR_RETRY_DELAY: time::Duration = time::Duration::from_secs(5);
pub const MAX_ERROR_RETRIES: usize = 3;
const MIN_BACKOFF: time::Duration = time::Duration::from_secs(1);
const MAX_BACKOFF: time::Duration = time::Duration::from_secs(30);

/// The status code the API server uses when a watch's resource version has expired.
const GONE: u16 = 410;

pub type EventStream<T> = BoxStream<'static, Result<WatchEvent<T>, kube::Error>>;

/// Lists and watches a single resource kind.
#[async_trait::async_trait]
pub trait ListWatch<T>: Send + Sync {
    /// Lists every object, returning the list's resource version.
    async fn list(&self) -> Result<(Vec<T>, Option<String>), kube::Error>;

    /// Watches for changes after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<EventStream<T>, kube::Error>;
}

#[derive(Clone, Debug)]
pub struct Config {
    /// How long to wait after an error event before reading the watch again.
    pub error_retry_delay: time::Duration,

    /// How many consecutive error events are tolerated before the watch is re-established.
    pub max_error_retries: usize,

    pub min_backoff: time::Duration,
    pub max_backoff: time::Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list {kind}: {source}")]
    List { kind: String, source: kube::Error },

    #[error("failed to watch {kind}: {source}")]
    Watch { kind: String, source: kube::Error },

    #[error("{kind} watch failed: {source}")]
    Stream { kind: String, source: kube::Error },
}

/// Why a watch stopped without failing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WatchEnd {
    /// The server closed the stream, usually because the watch timed out.
    Closed,

    /// The watch's resource version is too old to resume from.
    Expired,

    /// Too many consecutive error events were received.
    Errors,
}

/// Keeps a [`Mirror`] consistent with the cluster by listing and then watching its resource kind,
/// signaling [`Changes`] for every applied event.
pub struct Reflector<T: Mirrored, C> {
    kind: String,
    client: C,
    mirror: SharedMirror<T>,
    changes: Changes,
    metrics: KindMetrics,
    config: Config,
    listed: bool,

    /// Whether the current watch has delivered any object or bookmark.
    progressed: bool,
    synced: Option<oneshot::Sender<()>>,
}

/// Bounded exponential backoff.
#[derive(Debug)]
struct Backoff {
    min: time::Duration,
    max: time::Duration,
    next: time::Duration,
}

// === impl ListWatch ===

#[async_trait::async_trait]
impl<T: Mirrored> ListWatch<T> for Api<T> {
    async fn list(&self) -> Result<(Vec<T>, Option<String>), kube::Error> {
        let list = Api::<T>::list(self, &ListParams::default()).await?;
        Ok((list.items, list.metadata.resource_version))
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<T>, kube::Error> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let events = Api::<T>::watch(self, &params, resource_version).await?;
        Ok(events.boxed())
    }
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            error_retry_delay: ERROR_RETRY_DELAY,
            max_error_retries: MAX_ERROR_RETRIES,
            min_backoff: MIN_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

// === impl Reflector ===

impl<T, C> Reflector<T, C>
where
    T: Mirrored,
    C: ListWatch<T>,
{
    pub fn new(
        client: C,
        mirror: SharedMirror<T>,
        changes: Changes,
        metrics: KindMetrics,
        config: Config,
    ) -> Self {
        Self {
            kind: T::kind(&()).to_string(),
            client,
            mirror,
            changes,
            metrics,
            config,
            listed: false,
            progressed: false,
            synced: None,
        }
    }

    /// Notifies `synced` once the first list has been installed in the mirror.
    pub fn with_synced(mut self, synced: oneshot::Sender<()>) -> Self {
        self.synced = Some(synced);
        self
    }

    /// Lists and watches forever.
    ///
    /// Fails only if the very first list fails, since the collector has no baseline to serve without
    /// it. Later failures are retried with a bounded exponential backoff, as are watches that end
    /// before delivering anything.
    pub async fn run(mut self) -> Result<(), Error> {
        let mut backoff = Backoff::new(self.config.min_backoff, self.config.max_backoff);
        loop {
            match self.sync_once().await {
                Ok(end) if self.progressed => {
                    backoff.reset();
                    debug!(?end, "Watch ended; relisting");
                }
                Ok(end) => {
                    let delay = backoff.next_delay();
                    debug!(?end, ?delay, "Watch ended without events; relisting");
                    time::sleep(delay).await;
                }
                Err(error @ Error::List { .. }) if !self.listed => return Err(error),
                Err(error) => {
                    let delay = backoff.next_delay();
                    warn!(%error, ?delay, "Reconnecting");
                    time::sleep(delay).await;
                }
            }
        }
    }

    /// Lists once, installing the list in the mirror, and applies watch events until the watch
    /// ends.
    pub async fn sync_once(&mut self) -> Result<WatchEnd, Error> {
        let (items, version) = self.client.list().await.map_err(|source| Error::List {
            kind: self.kind.clone(),
            source,
        })?;
        let size = {
            let mut mirror = self.mirror.write();
            mirror.reset(items, version.clone());
            mirror.len()
        };
        self.metrics.reset(size);
        self.changes.signal();
        if !self.listed {
            info!(size, "Initial list complete");
            self.listed = true;
            if let Some(synced) = self.synced.take() {
                let _ = synced.send(());
            }
        } else {
            debug!(size, ?version, "Relisted");
        }

        let mut events = self
            .client
            .watch(version.as_deref().unwrap_or_default())
            .await
            .map_err(|source| Error::Watch {
                kind: self.kind.clone(),
                source,
            })?;

        self.progressed = false;
        let mut errors = 0;
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(kube::Error::SerdeError(error)) => {
                    self.metrics.malformed_event();
                    warn!(%error, "Dropping malformed watch event");
                    continue;
                }
                Err(source) => {
                    return Err(Error::Stream {
                        kind: self.kind.clone(),
                        source,
                    })
                }
            };

            match event {
                WatchEvent::Added(obj) => {
                    errors = 0;
                    self.progressed = true;
                    let size = self.apply("Added", &obj, Mirror::added);
                    self.metrics.applied(size);
                }
                WatchEvent::Modified(obj) => {
                    errors = 0;
                    self.progressed = true;
                    let size = self.apply("Modified", &obj, Mirror::modified);
                    self.metrics.applied(size);
                }
                WatchEvent::Deleted(obj) => {
                    errors = 0;
                    self.progressed = true;
                    let size = self.apply("Deleted", &obj, Mirror::deleted);
                    self.metrics.deleted(size);
                }
                WatchEvent::Bookmark(bookmark) => {
                    self.progressed = true;
                    self.mirror
                        .write()
                        .observe_version(bookmark.metadata.resource_version);
                }
                WatchEvent::Error(error) => {
                    self.metrics.watch_error();
                    if error.code == GONE {
                        debug!(?error, "Resource version expired");
                        return Ok(WatchEnd::Expired);
                    }
                    errors += 1;
                    if errors > self.config.max_error_retries {
                        warn!(?error, errors, "Too many watch errors; relisting");
                        return Ok(WatchEnd::Errors);
                    }
                    warn!(?error, retry = errors, delay = ?self.config.error_retry_delay, "Watch error");
                    time::sleep(self.config.error_retry_delay).await;
                }
            }
        }

        Ok(WatchEnd::Closed)
    }

    /// Applies an event to the mirror, returning the mirror's new size.
    fn apply(
        &self,
        event: &'static str,
        obj: &T,
        f: impl FnOnce(&mut Mirror<T>, &T) -> bool,
    ) -> usize {
        let (changed, size) = {
            let mut mirror = self.mirror.write();
            let changed = f(&mut *mirror, obj);
            (changed, mirror.len())
        };
        debug!(
            namespace = %obj.namespace().unwrap_or_default(),
            name = %obj.name_any(),
            changed,
            "{event}"
        );
        self.changes.signal();
        size
    }
}

// === impl Backoff ===

impl Backoff {
    fn new(min: time::Duration, max: time::Duration) -> Self {
        Self {
            min,
            max,
            next: min,
        }
    }

    fn next_delay(&mut self) -> time::Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}
