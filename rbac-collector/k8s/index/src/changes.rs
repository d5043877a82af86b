use std::sync::Arc;
use tokio::sync::Notify;

/// Coalesces change notifications from every mirror into at most one pending recomputation.
///
/// Producers call [`Changes::signal`] for each applied event; the single consumer awaits
/// [`Changes::changed`]. Any number of signals posted while nobody is waiting collapse into a single
/// stored permit, so a burst of events results in exactly one pending pass and producers never
/// block.
#[derive(Clone, Debug, Default)]
pub struct Changes(Arc<Notify>);

// === impl Changes ===

impl Changes {
    pub fn signal(&self) {
        self.0.notify_one();
    }

    /// Completes once at least one signal has been posted since the last completion.
    pub async fn changed(&self) {
        self.0.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn waits_for_a_signal() {
        let changes = Changes::default();
        let mut changed = task::spawn(changes.changed());
        assert_pending!(changed.poll());

        changes.signal();
        assert!(changed.is_woken());
        assert_ready!(changed.poll());
    }

    #[test]
    fn bursts_collapse_into_one_pending_change() {
        let changes = Changes::default();
        for _ in 0..10_000 {
            changes.signal();
        }

        assert_ready!(task::spawn(changes.changed()).poll());
        assert_pending!(task::spawn(changes.changed()).poll());
    }

    #[test]
    fn signals_during_a_pass_leave_one_pending() {
        let changes = Changes::default();
        changes.signal();
        assert_ready!(task::spawn(changes.changed()).poll());

        // Events arrive while the consumer is busy resolving.
        let producer = changes.clone();
        producer.signal();
        producer.signal();

        assert_ready!(task::spawn(changes.changed()).poll());
        assert_pending!(task::spawn(changes.changed()).poll());
    }
}
