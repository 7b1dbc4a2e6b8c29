//! Update progress reporting
//!
//! The orchestrator reports each phase of an attempt through an
//! [`UpdateProgress`] sink. The production sink publishes upgrade-progression
//! component events, which the state controller folds into the
//! `upgrade-progression` MachineState.

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use machina_common::crd::ComponentKind;
use machina_common::events::{ComponentEvent, ComponentEventPublisher};

/// Receives progress of an update attempt
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpdateProgress: Send + Sync {
    /// Report a phase with a machine-readable reason
    async fn report(&self, phase: &str, reason: &str);
}

/// Sink publishing upgrade-progression events about one node
pub struct EventProgress {
    publisher: Arc<dyn ComponentEventPublisher>,
    node: String,
}

impl EventProgress {
    /// Sink for `node` backed by `publisher`
    pub fn new(publisher: Arc<dyn ComponentEventPublisher>, node: impl Into<String>) -> Self {
        Self {
            publisher,
            node: node.into(),
        }
    }
}

#[async_trait]
impl UpdateProgress for EventProgress {
    async fn report(&self, phase: &str, reason: &str) {
        let event = ComponentEvent::for_node(&self.node, phase, reason);
        self.publisher
            .publish(ComponentKind::UpgradeProgression, &event)
            .await;
    }
}

/// Sink that drops everything
pub struct NoopProgress;

#[async_trait]
impl UpdateProgress for NoopProgress {
    async fn report(&self, _phase: &str, _reason: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(ComponentKind, ComponentEvent)>>);

    #[async_trait]
    impl ComponentEventPublisher for Recorder {
        async fn publish(&self, kind: ComponentKind, event: &ComponentEvent) {
            self.0.lock().unwrap().push((kind, event.clone()));
        }
    }

    #[tokio::test]
    async fn progress_becomes_upgrade_event_for_node() {
        let recorder = Arc::new(Recorder::default());
        let sink = EventProgress::new(recorder.clone(), "n1");

        sink.report("Rebasing", "UpdateStarted").await;

        let published = recorder.0.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let (kind, event) = &published[0];
        assert_eq!(*kind, ComponentKind::UpgradeProgression);
        assert_eq!(event.node(), Some("n1"));
        assert_eq!(event.message, "Rebasing");
        assert_eq!(event.reason, "UpdateStarted");
    }
}
