//! Common types for Machina: CRDs, errors, selectors and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace where component health events are published and watched
pub const OPERATOR_NAMESPACE: &str = "openshift-machine-config-operator";

/// Node label carrying the operating system family (set by the kubelet)
pub const OS_LABEL: &str = "kubernetes.io/os";

/// Value of [`OS_LABEL`] that marks a node as non-Linux
pub const WINDOWS_OS_VALUE: &str = "windows";

/// Event annotation key carrying the name of the node an event is about
pub const NODE_ANNOTATION: &str = "node";

/// Name of the role-A pool (control plane)
pub const MASTER_POOL: &str = "master";

/// Name of the role-B pool (generic workers)
pub const WORKER_POOL: &str = "worker";

/// Field manager used for writes made by Machina controllers
pub const FIELD_MANAGER: &str = "machina-controller";
