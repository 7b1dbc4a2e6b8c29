//! MachineConfigPool CRD
//!
//! A pool is a named group of nodes sharing one OS configuration. Pool
//! membership is decided by the node selector; the pool's role is decided by
//! its name.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::selector::NodeSelector;
use crate::{MASTER_POOL, WORKER_POOL};

/// MachineConfigPool groups nodes that receive the same OS configuration.
///
/// Example:
/// ```yaml
/// apiVersion: machineconfiguration.machina.dev/v1
/// kind: MachineConfigPool
/// metadata:
///   name: infra
/// spec:
///   nodeSelector:
///     matchLabels:
///       node-role.kubernetes.io/infra: ""
///   osImageURL: quay.io/example/os@sha256:...
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machineconfiguration.machina.dev",
    version = "v1",
    kind = "MachineConfigPool",
    plural = "machineconfigpools",
    shortname = "mcp",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.osImageURL"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolSpec {
    /// Selects the nodes that belong to this pool. Absent or empty selects none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,

    /// Desired OS image for nodes in this pool
    #[serde(
        default,
        rename = "osImageURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub os_image_url: Option<String>,

    /// Paused pools are resolved normally but not rolled out
    #[serde(default)]
    pub paused: bool,
}

/// Role of a pool, derived from its name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolRole {
    /// Control plane pool (`master`); wins every tie-break
    Master,
    /// Default worker pool (`worker`)
    Worker,
    /// Any other pool
    Custom,
}

impl PoolRole {
    /// Classify a pool by name
    pub fn from_pool_name(name: &str) -> Self {
        match name {
            MASTER_POOL => PoolRole::Master,
            WORKER_POOL => PoolRole::Worker,
            _ => PoolRole::Custom,
        }
    }
}

impl MachineConfigPool {
    /// Build a pool with the given name and selector
    pub fn with_selector(name: &str, selector: Option<NodeSelector>) -> Self {
        MachineConfigPool::new(
            name,
            MachineConfigPoolSpec {
                node_selector: selector,
                ..Default::default()
            },
        )
    }

    /// Role of this pool
    pub fn role(&self) -> PoolRole {
        PoolRole::from_pool_name(&self.name_any())
    }

    /// Check whether this pool selects a node with the given labels
    pub fn selects(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        self.spec
            .node_selector
            .as_ref()
            .is_some_and(|s| s.matches(labels))
    }
}
