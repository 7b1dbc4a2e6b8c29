//! Bootstrap sub-controller
//!
//! During cluster bootstrap the installer publishes events with source
//! `bootstrap`. They are not folded into any record; the monitor only logs
//! them until the controller stops it.

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use machina_common::events::ComponentEvent;

/// Event source used by the installer during bootstrap
pub const BOOTSTRAP_EVENT_SOURCE: &str = "bootstrap";

/// Logs bootstrap events until stopped
pub struct BootstrapMonitor {
    stop: CancellationToken,
}

impl BootstrapMonitor {
    /// Monitor that also stops when `parent` is cancelled
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            stop: parent.child_token(),
        }
    }

    /// Consume `events` until the stream ends or the monitor is stopped.
    ///
    /// Returns the number of events seen.
    pub async fn run<S, E>(&self, events: S) -> usize
    where
        S: Stream<Item = Result<Event, E>>,
        E: std::fmt::Display,
    {
        futures::pin_mut!(events);
        let mut seen = 0;
        info!("bootstrap monitor started");
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        seen += 1;
                        let event = ComponentEvent::from_event(&event);
                        info!(
                            node = event.node().unwrap_or_default(),
                            reason = %event.reason,
                            message = %event.message,
                            "bootstrap event"
                        );
                    }
                    Some(Err(e)) => warn!(error = %e, "bootstrap watch error"),
                    None => break,
                }
            }
        }
        debug!(seen, "bootstrap monitor stopped");
        seen
    }

    /// Stop the monitor
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// True once [`BootstrapMonitor::stop`] was called or the parent cancelled
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
