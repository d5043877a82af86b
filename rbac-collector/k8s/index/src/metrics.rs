use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct MirrorMetrics {
    size: Family<KindLabels, Gauge>,
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    resets: Family<KindLabels, Counter>,
    watch_errors: Family<KindLabels, Counter>,
    malformed_events: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

/// Metrics for a single mirrored resource kind.
#[derive(Clone, Debug)]
pub struct KindMetrics {
    labels: KindLabels,
    metrics: MirrorMetrics,
}

// === impl MirrorMetrics ===

impl MirrorMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let size = Family::default();
        prom.register(
            "size",
            "Gauge of the number of resources in the mirror",
            size.clone(),
        );

        let applies = Family::default();
        prom.register(
            "applies",
            "Count of added or modified events applied to the mirror",
            applies.clone(),
        );

        let deletes = Family::default();
        prom.register(
            "deletes",
            "Count of deleted events applied to the mirror",
            deletes.clone(),
        );

        let resets = Family::default();
        prom.register(
            "resets",
            "Count of full lists installed in the mirror",
            resets.clone(),
        );

        let watch_errors = Family::default();
        prom.register(
            "watch_errors",
            "Count of error events received on the watch",
            watch_errors.clone(),
        );

        let malformed_events = Family::default();
        prom.register(
            "malformed_events",
            "Count of watch events that could not be decoded",
            malformed_events.clone(),
        );

        Self {
            size,
            applies,
            deletes,
            resets,
            watch_errors,
            malformed_events,
        }
    }

    pub fn kind(&self, kind: impl ToString) -> KindMetrics {
        KindMetrics {
            labels: KindLabels {
                kind: kind.to_string(),
            },
            metrics: self.clone(),
        }
    }
}

// === impl KindMetrics ===

impl KindMetrics {
    pub(crate) fn applied(&self, size: usize) {
        self.metrics.applies.get_or_create(&self.labels).inc();
        self.set_size(size);
    }

    pub(crate) fn deleted(&self, size: usize) {
        self.metrics.deletes.get_or_create(&self.labels).inc();
        self.set_size(size);
    }

    pub(crate) fn reset(&self, size: usize) {
        self.metrics.resets.get_or_create(&self.labels).inc();
        self.set_size(size);
    }

    pub(crate) fn watch_error(&self) {
        self.metrics.watch_errors.get_or_create(&self.labels).inc();
    }

    pub(crate) fn malformed_event(&self) {
        self.metrics.malformed_events.get_or_create(&self.labels).inc();
    }

    fn set_size(&self, size: usize) {
        self.metrics
            .size
            .get_or_create(&self.labels)
            .set(size as i64);
    }
}
