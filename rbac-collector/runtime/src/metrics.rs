use crate::core::PermissionIndex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    passes: Counter,
    publishes: Counter,
    publish_failures: Counter,
    index_subjects: Family<PartitionLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PartitionLabels {
    partition: &'static str,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let passes = Counter::default();
        prom.register(
            "passes",
            "Count of resolution passes run by the controller",
            passes.clone(),
        );

        let publishes = Counter::default();
        prom.register(
            "publishes",
            "Count of changed indexes published",
            publishes.clone(),
        );

        let publish_failures = Counter::default();
        prom.register(
            "publish_failures",
            "Count of failed attempts to publish an index",
            publish_failures.clone(),
        );

        let index_subjects = Family::default();
        prom.register(
            "index_subjects",
            "Gauge of the number of subjects in the last resolved index",
            index_subjects.clone(),
        );

        Self {
            passes,
            publishes,
            publish_failures,
            index_subjects,
        }
    }

    pub(crate) fn resolved(&self, index: &PermissionIndex) {
        self.passes.inc();
        self.index_subjects
            .get_or_create(&PartitionLabels { partition: "users" })
            .set(index.users.len() as i64);
        self.index_subjects
            .get_or_create(&PartitionLabels { partition: "groups" })
            .set(index.groups.len() as i64);
    }

    pub(crate) fn published(&self) {
        self.publishes.inc();
    }

    pub(crate) fn publish_failed(&self) {
        self.publish_failures.inc();
    }
}
