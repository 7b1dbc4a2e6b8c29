//! MachineState aggregation
//!
//! Component health and progress events are folded into one durable
//! MachineState record per component kind. See [`controller`] for the
//! reconciliation loop and [`writer`] for how a single event is recorded.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod controller;
pub mod helpers;
pub mod sources;
pub mod store;
pub mod workqueue;
pub mod writer;

pub use bootstrap::BootstrapMonitor;
pub use controller::{
    handle_err, StateController, StateControllerConfig, SubController, MAX_RETRIES,
};
pub use helpers::{
    is_upgrading_progression_true, is_upgrading_progression_true_for_pool,
    machine_state_for_pool, machine_state_name_for_pool,
};
pub use sources::EventBuffers;
pub use store::{ensure_records, KubeStateStore, StateStore};
pub use workqueue::{RateLimitingQueue, WorkQueue};
pub use writer::{apply_observation, StatusWriter};
