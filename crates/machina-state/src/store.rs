//! Record store access
//!
//! The controller reads and writes MachineState records and resolves node
//! names through this trait so that it can be exercised without a cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use machina_common::crd::{ComponentKind, MachineState};
use machina_common::{Error, Result};

/// Get/update access to MachineState records and nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch a record by name
    async fn get_state(&self, name: &str) -> Result<MachineState>;

    /// Create a record
    async fn create_state(&self, state: &MachineState) -> Result<MachineState>;

    /// Replace a record's status. Stale resource versions fail with a conflict.
    async fn update_status(&self, state: &MachineState) -> Result<MachineState>;

    /// Replace a record's spec and metadata
    async fn update_spec(&self, state: &MachineState) -> Result<MachineState>;

    /// Fetch a node by name
    async fn get_node(&self, name: &str) -> Result<Node>;
}

/// [`StateStore`] backed by the Kubernetes API
pub struct KubeStateStore {
    client: Client,
}

impl KubeStateStore {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn states(&self) -> Api<MachineState> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl StateStore for KubeStateStore {
    async fn get_state(&self, name: &str) -> Result<MachineState> {
        Ok(self.states().get(name).await?)
    }

    async fn create_state(&self, state: &MachineState) -> Result<MachineState> {
        Ok(self.states().create(&PostParams::default(), state).await?)
    }

    async fn update_status(&self, state: &MachineState) -> Result<MachineState> {
        let body = serde_json::to_vec(state)
            .map_err(|e| Error::serialization_for_kind("MachineState", e.to_string()))?;
        Ok(self
            .states()
            .replace_status(&state.name_any(), &PostParams::default(), body)
            .await?)
    }

    async fn update_spec(&self, state: &MachineState) -> Result<MachineState> {
        Ok(self
            .states()
            .replace(&state.name_any(), &PostParams::default(), state)
            .await?)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

/// Create the record for every component kind that does not have one yet
pub async fn ensure_records(store: &dyn StateStore) -> Result<()> {
    for kind in ComponentKind::ALL {
        match store.get_state(kind.as_str()).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!(record = kind.as_str(), "creating MachineState");
                match store.create_state(&MachineState::for_kind(kind)).await {
                    Ok(_) => {}
                    // another controller replica won the race
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
