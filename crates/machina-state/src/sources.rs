//! Component event subscriptions
//!
//! One long-lived task per component kind watches core/v1 Events whose
//! `source` is the kind's tag. Each event is parked in the kind's buffer and
//! the kind's record key is queued; the sync for that key drains the buffer.
//! Subscriptions never run on queue workers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use machina_common::crd::ComponentKind;
use machina_common::events::ComponentEvent;

use crate::workqueue::WorkQueue;

/// Watch timeout (seconds); must stay below the client read timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Pending events per component kind
#[derive(Default)]
pub struct EventBuffers {
    pending: Mutex<HashMap<ComponentKind, VecDeque<ComponentEvent>>>,
}

impl EventBuffers {
    /// Empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an event for `kind`
    pub fn push(&self, kind: ComponentKind, event: ComponentEvent) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push_back(event);
    }

    /// Take every pending event for `kind`, oldest first. Never blocks on I/O.
    pub fn drain(&self, kind: ComponentKind) -> Vec<ComponentEvent> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&kind)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of pending events for `kind`
    pub fn pending(&self, kind: ComponentKind) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, VecDeque::len)
    }
}

/// Identity of an event revision, so relists do not replay it
fn revision(event: &Event) -> Option<(String, String)> {
    Some((
        event.metadata.uid.clone()?,
        event.metadata.resource_version.clone()?,
    ))
}

/// Revisions already delivered for live events.
///
/// Entries leave on delete, and a relist keeps only the events it listed,
/// so expired events do not pile up.
#[derive(Debug, Default)]
pub(crate) struct SeenRevisions {
    current: HashMap<String, String>,
    relist: Option<HashMap<String, String>>,
}

impl SeenRevisions {
    /// Remember `event`; false if this exact revision was already delivered
    pub(crate) fn observe(&mut self, event: &Event) -> bool {
        let Some((uid, rv)) = revision(event) else {
            return true;
        };
        if let Some(relist) = self.relist.as_mut() {
            relist.insert(uid.clone(), rv.clone());
        }
        self.current.insert(uid, rv.clone()) != Some(rv)
    }

    pub(crate) fn forget(&mut self, event: &Event) {
        if let Some(uid) = event.metadata.uid.as_deref() {
            self.current.remove(uid);
            if let Some(relist) = self.relist.as_mut() {
                relist.remove(uid);
            }
        }
    }

    pub(crate) fn begin_relist(&mut self) {
        self.relist = Some(HashMap::new());
    }

    pub(crate) fn finish_relist(&mut self) {
        if let Some(listed) = self.relist.take() {
            self.current = listed;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.current.len()
    }
}

/// Feed `events` into the buffer for `kind` until the stream ends or `cancel` fires
pub async fn pump_events<S, E>(
    kind: ComponentKind,
    events: S,
    buffers: Arc<EventBuffers>,
    queue: Arc<dyn WorkQueue>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<Event>, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(events);
    let mut seen = SeenRevisions::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(source = kind.event_source(), "event subscription cancelled");
                break;
            }
            next = events.next() => match next {
                Some(Ok(watcher::Event::Apply(event) | watcher::Event::InitApply(event))) => {
                    if !seen.observe(&event) {
                        continue;
                    }
                    buffers.push(kind, ComponentEvent::from_event(&event));
                    queue.add(kind.as_str());
                }
                Some(Ok(watcher::Event::Delete(event))) => seen.forget(&event),
                Some(Ok(watcher::Event::Init)) => seen.begin_relist(),
                Some(Ok(watcher::Event::InitDone)) => {
                    seen.finish_relist();
                    debug!(source = kind.event_source(), tracked = seen.len(), "event relist complete");
                }
                // the watcher backs off and re-establishes itself
                Some(Err(e)) => warn!(source = kind.event_source(), error = %e, "event watch error"),
                None => {
                    info!(source = kind.event_source(), "event subscription ended");
                    break;
                }
            }
        }
    }
}

/// Watch of core/v1 Events in `namespace` whose source is `source`, deletes and relists included
pub fn watch_events_from(
    client: Client,
    namespace: &str,
    source: &str,
) -> impl Stream<Item = Result<watcher::Event<Event>, watcher::Error>> + Send {
    let api: Api<Event> = Api::namespaced(client, namespace);
    let config = watcher::Config::default()
        .fields(&format!("source={}", source))
        .timeout(WATCH_TIMEOUT_SECS);
    watcher(api, config).default_backoff()
}

/// Start one subscription task per component kind
pub fn spawn_component_sources(
    client: Client,
    namespace: &str,
    buffers: Arc<EventBuffers>,
    queue: Arc<dyn WorkQueue>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    ComponentKind::ALL
        .into_iter()
        .map(|kind| {
            let events = watch_events_from(client.clone(), namespace, kind.event_source());
            info!(source = kind.event_source(), record = kind.as_str(), "starting event subscription");
            tokio::spawn(pump_events(
                kind,
                events,
                buffers.clone(),
                queue.clone(),
                cancel.clone(),
            ))
        })
        .collect()
}

/// Log a subscription task that ended abnormally
pub async fn join_sources(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "event subscription task failed");
        }
    }
}
