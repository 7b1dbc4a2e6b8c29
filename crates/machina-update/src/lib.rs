//! OS image updates for Machina nodes
//!
//! The [`UpdateOrchestrator`] probes what the host's update agent can do,
//! picks an [`Updater`] strategy, makes registry credentials available and
//! runs the strategy through a [`CommandRunner`]. All privileged host
//! mutations go through that runner.

#![deny(missing_docs)]

pub mod command;
pub mod config;
pub mod credentials;
pub mod deployment;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod selinux;
pub mod strategy;
pub mod workaround;

pub use command::{truncate, CommandRunner, HostCommand, RealCommandRunner};
pub use config::HostPaths;
pub use deployment::{query_deployments, Deployment, DeploymentStatus};
pub use orchestrator::UpdateOrchestrator;
pub use probe::{HostCapability, UpdateAgent};
pub use progress::{EventProgress, NoopProgress, UpdateProgress};
pub use strategy::{select_strategy, StrategyKind, UpdateTarget, Updater};
