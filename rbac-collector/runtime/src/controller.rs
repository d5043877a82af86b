use crate::{
    core::{ExclusionPolicy, PermissionIndex},
    index::{Changes, Mirrors},
    metrics::ControllerMetrics,
    publish::{self, Publish},
};
use std::future::Future;
use tokio::time;
use tracing::{debug, info, warn};

/// The minimum time between two resolution passes.
pub const QUIESCENCE: time::Duration = time::Duration::from_secs(5);

/// Recomputes the permission index whenever the mirrors change and publishes it when it differs
/// from what was last published.
pub struct Controller<P> {
    mirrors: Mirrors,
    changes: Changes,
    policy: ExclusionPolicy,
    gate: DiffGate,
    sink: P,
    quiescence: time::Duration,
    metrics: ControllerMetrics,
}

/// Remembers the last successfully published index so that unchanged indexes are not written
/// again.
#[derive(Clone, Debug, Default)]
pub struct DiffGate {
    published: Option<PermissionIndex>,
}

/// The outcome of a single resolution pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pass {
    Unchanged,
    Published,
    Failed,
}

// === impl Controller ===

impl<P: Publish> Controller<P> {
    pub fn new(
        mirrors: Mirrors,
        changes: Changes,
        policy: ExclusionPolicy,
        sink: P,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            mirrors,
            changes,
            policy,
            gate: DiffGate::default(),
            sink,
            quiescence: QUIESCENCE,
            metrics,
        }
    }

    pub fn with_quiescence(mut self, quiescence: time::Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    /// Runs a pass for each change until shutdown.
    ///
    /// No pass runs before `synced` completes, so that a partially listed cluster is never
    /// published. Changes posted before then are kept and trigger the first pass. Changes that
    /// arrive while a pass runs, or during the quiescence interval that follows it, are coalesced
    /// into a single subsequent pass.
    pub async fn run<S>(mut self, synced: S, drain: drain::Watch)
    where
        S: Future<Output = ()>,
    {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        tokio::select! {
            biased;
            _ = (&mut shutdown) => {
                info!("Shutting down");
                return;
            }
            _ = synced => debug!("Mirrors synced"),
        }

        loop {
            tokio::select! {
                biased;
                _ = (&mut shutdown) => {
                    info!("Shutting down");
                    return;
                }
                _ = self.changes.changed() => {}
            }

            self.pass().await;

            tokio::select! {
                biased;
                _ = (&mut shutdown) => {
                    info!("Shutting down");
                    return;
                }
                _ = time::sleep(self.quiescence) => {}
            }
        }
    }

    /// Resolves the current mirrors and publishes the result if it changed.
    ///
    /// A failed publish posts a new change so that the next pass retries it.
    pub async fn pass(&mut self) -> Pass {
        let index = self.mirrors.snapshot().resolve(&self.policy);
        self.metrics.resolved(&index);
        debug!(
            users = index.users.len(),
            groups = index.groups.len(),
            "Resolved"
        );

        match self.gate.publish(index, &self.sink).await {
            Ok(false) => {
                debug!("Index unchanged");
                Pass::Unchanged
            }
            Ok(true) => {
                self.metrics.published();
                info!("Published index");
                Pass::Published
            }
            Err(error) => {
                self.metrics.publish_failed();
                warn!(%error, "Failed to publish index");
                self.changes.signal();
                Pass::Failed
            }
        }
    }
}

// === impl DiffGate ===

impl DiffGate {
    /// Indicates whether `index` differs from the last published index.
    ///
    /// Nothing has been published initially, so the first index is always changed.
    pub fn is_changed(&self, index: &PermissionIndex) -> bool {
        self.published.as_ref() != Some(index)
    }

    /// Publishes `index` if it changed, returning whether it was published.
    ///
    /// The retained index is only replaced once the sink accepts the new one.
    pub async fn publish<P>(
        &mut self,
        index: PermissionIndex,
        sink: &P,
    ) -> Result<bool, publish::Error>
    where
        P: Publish + ?Sized,
    {
        if !self.is_changed(&index) {
            return Ok(false);
        }
        sink.publish(&index).await?;
        self.published = Some(index);
        Ok(true)
    }

    pub fn published(&self) -> Option<&PermissionIndex> {
        self.published.as_ref()
    }
}
