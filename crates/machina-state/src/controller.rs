//! MachineState controller
//!
//! Record changes are turned into delayed queue keys; a fixed pool of workers
//! pulls keys and runs the sync for the key's component kind. The sync drains
//! the events parked for that kind by the subscription tasks, folds each into
//! the record's status, then writes the record spec back.
//!
//! Failed keys are retried with per-key backoff up to [`MAX_RETRIES`] times,
//! after which the failure is reported, the key's backoff is reset and it is
//! retried once more after [`DROP_REQUEUE_DELAY`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use machina_common::crd::{ComponentKind, MachineState};
use machina_common::{Error, Result, OPERATOR_NAMESPACE};

use crate::bootstrap::{BootstrapMonitor, BOOTSTRAP_EVENT_SOURCE};
use crate::sources::{
    join_sources, spawn_component_sources, watch_events_from, EventBuffers, WATCH_TIMEOUT_SECS,
};
use crate::store::StateStore;
use crate::workqueue::WorkQueue;
use crate::writer::StatusWriter;

/// Rate-limited requeues before a key is dropped
pub const MAX_RETRIES: u32 = 15;

/// Delay of the single requeue after a key is dropped
pub const DROP_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Default delay between a record change and its sync
pub const DEFAULT_UPDATE_DELAY: Duration = Duration::from_secs(5);

/// Default number of queue workers
pub const DEFAULT_WORKERS: usize = 2;

/// Optional helpers started alongside the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubController {
    /// Logs installer events while the cluster bootstraps
    Bootstrap,
}

/// Controller settings
#[derive(Clone, Debug)]
pub struct StateControllerConfig {
    /// Number of queue workers
    pub workers: usize,
    /// Delay between a record change and its sync
    pub update_delay: Duration,
    /// Namespace component events are published in
    pub namespace: String,
    /// Sub-controllers to start
    pub sub_controllers: Vec<SubController>,
}

impl Default for StateControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            update_delay: DEFAULT_UPDATE_DELAY,
            namespace: OPERATOR_NAMESPACE.to_string(),
            sub_controllers: vec![SubController::Bootstrap],
        }
    }
}

/// Aggregates component events into MachineState records
pub struct StateController {
    store: Arc<dyn StateStore>,
    writer: StatusWriter,
    queue: Arc<dyn WorkQueue>,
    buffers: Arc<EventBuffers>,
    config: StateControllerConfig,
}

impl StateController {
    /// Controller over `store`, fed through `queue`
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn WorkQueue>,
        config: StateControllerConfig,
    ) -> Self {
        Self {
            writer: StatusWriter::new(store.clone()),
            store,
            queue,
            buffers: Arc::new(EventBuffers::new()),
            config,
        }
    }

    /// Buffers the subscription tasks push events into
    pub fn buffers(&self) -> Arc<EventBuffers> {
        self.buffers.clone()
    }

    /// Controller settings
    pub fn config(&self) -> &StateControllerConfig {
        &self.config
    }

    /// A record appeared
    pub fn on_add(&self, state: &MachineState) {
        debug!(record = %state.name_any(), "adding MachineState");
        self.enqueue(state);
    }

    /// A record changed. Status changes come from this controller only and
    /// are not reconciled.
    pub fn on_update(&self, old: &MachineState, new: &MachineState) {
        if old.status != new.status {
            warn!(record = %new.name_any(), "user cannot change MachineState status via the API");
            return;
        }
        debug!(record = %new.name_any(), "updating MachineState");
        self.enqueue(new);
    }

    fn enqueue(&self, state: &MachineState) {
        let name = state.name_any();
        if ComponentKind::from_record_name(&name).is_none() {
            debug!(record = %name, "not a component record, skipping");
            return;
        }
        self.queue.add_after(&name, self.config.update_delay);
    }

    /// Fold the pending events for `key`'s kind into its record.
    ///
    /// The record is read before the buffer is drained, so a missing record
    /// leaves the events parked for the retry.
    #[instrument(skip(self))]
    pub async fn sync(&self, key: &str) -> Result<()> {
        let kind = ComponentKind::from_record_name(key)
            .ok_or_else(|| Error::validation_for(key, "unknown MachineState kind"))?;
        self.store.get_state(key).await?;

        let events = self.buffers.drain(kind);
        debug!(count = events.len(), "draining component events");
        for event in &events {
            self.writer
                .write_status(kind, &event.message, &event.reason, &event.annotations)
                .await;
        }

        // status writes moved the resource version on
        let current = self.store.get_state(key).await?;
        self.writer.write_spec(&current).await
    }

    /// Handle one key. Returns false once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let result = self.sync(&key).await;
        handle_err(self.queue.as_ref(), &key, result);
        self.queue.done(&key);
        true
    }

    /// Run the workers until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(workers = self.config.workers, "starting MachineState controller");

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|_| {
                let controller = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    while !cancel.is_cancelled() && controller.process_next_work_item().await {}
                })
            })
            .collect();

        cancel.cancelled().await;
        info!("shutting down MachineState controller");
        self.queue.shut_down();

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "MachineState worker failed");
            }
        }
    }

    /// Feed record watch events into [`StateController::on_add`] and
    /// [`StateController::on_update`]
    pub async fn watch_records<S, E>(&self, records: S, cancel: CancellationToken)
    where
        S: Stream<Item = std::result::Result<watcher::Event<MachineState>, E>>,
        E: std::fmt::Display,
    {
        futures::pin_mut!(records);
        let mut cache: HashMap<String, MachineState> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = records.next() => match next {
                    Some(Ok(watcher::Event::Apply(state) | watcher::Event::InitApply(state))) => {
                        match cache.insert(state.name_any(), state.clone()) {
                            Some(old) => self.on_update(&old, &state),
                            None => self.on_add(&state),
                        }
                    }
                    Some(Ok(watcher::Event::Delete(state))) => {
                        cache.remove(&state.name_any());
                    }
                    Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
                    Some(Err(e)) => warn!(error = %e, "MachineState watch error"),
                    None => break,
                }
            }
        }
    }

    /// Start subscriptions, the record watcher and enabled sub-controllers,
    /// then run the workers until `cancel` fires
    pub async fn start(self: Arc<Self>, client: Client, cancel: CancellationToken) {
        let sources = spawn_component_sources(
            client.clone(),
            &self.config.namespace,
            self.buffers(),
            self.queue.clone(),
            cancel.clone(),
        );

        let records = {
            let controller = self.clone();
            let cancel = cancel.clone();
            let api: Api<MachineState> = Api::all(client.clone());
            let stream = watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
                .default_backoff();
            tokio::spawn(async move { controller.watch_records(stream, cancel).await })
        };

        let bootstrap = self
            .config
            .sub_controllers
            .contains(&SubController::Bootstrap)
            .then(|| {
                let monitor = Arc::new(BootstrapMonitor::new(&cancel));
                let events =
                    watch_events_from(client.clone(), &self.config.namespace, BOOTSTRAP_EVENT_SOURCE)
                        .applied_objects();
                let task = {
                    let monitor = monitor.clone();
                    tokio::spawn(async move { monitor.run(events).await })
                };
                (monitor, task)
            });

        self.clone().run(cancel).await;

        if let Some((monitor, task)) = bootstrap {
            monitor.stop();
            if let Err(e) = task.await {
                error!(error = %e, "bootstrap monitor failed");
            }
        }
        if let Err(e) = records.await {
            error!(error = %e, "MachineState watcher failed");
        }
        join_sources(sources).await;
    }
}

/// Settle a processed key: forget it on success, otherwise requeue it with
/// backoff until it has failed [`MAX_RETRIES`] times
pub fn handle_err(queue: &dyn WorkQueue, key: &str, result: Result<()>) {
    let Err(e) = result else {
        queue.forget(key);
        return;
    };

    let requeues = queue.num_requeues(key);
    if requeues < MAX_RETRIES {
        debug!(key, requeues, error = %e, "error syncing MachineState, retrying");
        queue.add_rate_limited(key);
        return;
    }

    error!(key, requeues, error = %e, "dropping MachineState out of the queue");
    queue.forget(key);
    queue.add_after(key, DROP_REQUEUE_DELAY);
}
