//! Event Bus (§4.7): the single path every domain event flows through on
//! its way from the Turn Engine / Approval Bridge / Scheduler to the five
//! projections. Fan-out is sequential and each projection's failure is
//! isolated — one projection erroring never stops the others, and never
//! fails the operation that published the event.

use std::sync::Arc;

use super::envelope::WorkflowEventEnvelope;

/// A sink that reacts to published events. Implementations must not block
/// the bus for long — do async I/O, don't loop.
#[async_trait::async_trait]
pub trait Projection: Send + Sync {
    /// Short name used in error logs when this projection fails.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &WorkflowEventEnvelope) -> anyhow::Result<()>;
}

/// Fans out every published event to its registered projections in order.
pub struct EventBus {
    projections: Vec<Arc<dyn Projection>>,
}

impl EventBus {
    pub fn new(projections: Vec<Arc<dyn Projection>>) -> Self {
        Self { projections }
    }

    /// Publish `event` to every registered projection. Projections run
    /// sequentially in registration order; a failing projection is logged
    /// and skipped, never aborting the remaining ones.
    pub async fn publish(&self, event: WorkflowEventEnvelope) {
        for projection in &self.projections {
            if let Err(e) = projection.handle(&event).await {
                tracing::error!(
                    projection = projection.name(),
                    event_type = %event.event_type,
                    session_id = %event.session_id,
                    error = %e,
                    "projection failed to handle event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::orchestration::EventVisibility;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProjection {
        name: &'static str,
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Projection for CountingProjection {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn handle(&self, _event: &WorkflowEventEnvelope) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn sample_event() -> WorkflowEventEnvelope {
        WorkflowEventEnvelope::new(
            "s1",
            "r1",
            Some("t1".into()),
            "chapo",
            EventVisibility::Ui,
            "wf.turn_started",
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_projections() {
        let c1 = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::new(vec![
            Arc::new(CountingProjection { name: "p1", count: c1.clone(), fail: false }),
            Arc::new(CountingProjection { name: "p2", count: c2.clone(), fail: false }),
        ]);
        bus.publish(sample_event()).await;
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_projection_failing_does_not_block_others() {
        let c1 = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::new(vec![
            Arc::new(CountingProjection { name: "failing", count: c1.clone(), fail: true }),
            Arc::new(CountingProjection { name: "ok", count: c2.clone(), fail: false }),
        ]);
        bus.publish(sample_event()).await;
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }
}
