//! Read access to pools and nodes
//!
//! The resolver itself is pure; this trait is the seam between it and the API
//! server so callers can be tested without a cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use machina_common::crd::MachineConfigPool;
use machina_common::{Error, Result};

use crate::resolver::{nodes_for_pool, resolve_pools, PoolAssignment};

/// Lists pools and nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolLister: Send + Sync {
    /// All MachineConfigPools in the cluster
    async fn list_pools(&self) -> Result<Vec<MachineConfigPool>>;

    /// All nodes in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Fetch a single node by name
    async fn get_node(&self, name: &str) -> Result<Node>;
}

/// [`PoolLister`] backed by the Kubernetes API
pub struct KubePoolLister {
    client: Client,
}

impl KubePoolLister {
    /// Create a lister wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PoolLister for KubePoolLister {
    async fn list_pools(&self) -> Result<Vec<MachineConfigPool>> {
        let api: Api<MachineConfigPool> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

/// Fetch a node by name and resolve its pools against the current pool list
pub async fn pools_for_node_name(
    lister: &dyn PoolLister,
    node_name: &str,
) -> Result<Option<PoolAssignment>> {
    let node = lister.get_node(node_name).await?;
    let pools = lister.list_pools().await?;
    resolve_pools(&node, &pools)
}

/// Nodes whose effective pool is `pool_name`
pub async fn nodes_for_pool_name(lister: &dyn PoolLister, pool_name: &str) -> Result<Vec<Node>> {
    let pools = lister.list_pools().await?;
    let pool = pools
        .iter()
        .find(|p| p.metadata.name.as_deref() == Some(pool_name))
        .ok_or_else(|| Error::validation_for(pool_name, "no such MachineConfigPool"))?;
    let nodes = lister.list_nodes().await?;
    Ok(nodes_for_pool(pool, &nodes, &pools))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::ResourceExt;
    use machina_common::crd::NodeSelector;

    fn labelled_node(name: &str, label: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some([(label.to_string(), String::new())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_named_node_through_lister() {
        let mut lister = MockPoolLister::new();
        lister
            .expect_get_node()
            .withf(|name| name == "n1")
            .returning(|_| Ok(labelled_node("n1", "node-role.kubernetes.io/worker")));
        lister.expect_list_pools().returning(|| {
            Ok(vec![MachineConfigPool::with_selector(
                "worker",
                Some(NodeSelector::with_label("node-role.kubernetes.io/worker", "")),
            )])
        });

        let assignment = pools_for_node_name(&lister, "n1").await.unwrap().unwrap();
        assert_eq!(assignment.effective().name_any(), "worker");
    }

    #[tokio::test]
    async fn lister_errors_propagate() {
        let mut lister = MockPoolLister::new();
        lister
            .expect_get_node()
            .returning(|_| Err(Error::internal("api unavailable")));
        lister.expect_list_pools().never();

        assert!(pools_for_node_name(&lister, "n1").await.is_err());
    }

    #[tokio::test]
    async fn pool_nodes_exclude_nodes_owned_elsewhere() {
        let mut lister = MockPoolLister::new();
        lister.expect_list_pools().returning(|| {
            Ok(vec![
                MachineConfigPool::with_selector(
                    "worker",
                    Some(NodeSelector::with_label("node-role.kubernetes.io/worker", "")),
                ),
                MachineConfigPool::with_selector(
                    "infra",
                    Some(NodeSelector::with_label("node-role.kubernetes.io/infra", "")),
                ),
            ])
        });
        lister.expect_list_nodes().returning(|| {
            let mut infra = labelled_node("n2", "node-role.kubernetes.io/worker");
            infra
                .labels_mut()
                .insert("node-role.kubernetes.io/infra".to_string(), String::new());
            Ok(vec![labelled_node("n1", "node-role.kubernetes.io/worker"), infra])
        });

        let nodes = nodes_for_pool_name(&lister, "worker").await.unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.name_any()).collect();
        assert_eq!(names, vec!["n1"]);
    }

    #[tokio::test]
    async fn unknown_pool_is_rejected() {
        let mut lister = MockPoolLister::new();
        lister.expect_list_pools().returning(|| Ok(vec![]));
        lister.expect_list_nodes().never();

        let err = nodes_for_pool_name(&lister, "gpu").await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
