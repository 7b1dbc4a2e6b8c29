//! Node to pool resolution
//!
//! Pools are partitioned by role: `master`, `worker` and custom. A node may
//! match several of them; the tie-break is:
//!
//! 1. non-Linux nodes are unmanaged
//! 2. more than one custom match is an error
//! 3. one custom match plus master: master is effective, custom is secondary,
//!    worker (if matched) trails as tertiary
//! 4. one custom match without master: custom is effective, worker secondary
//! 5. master beats worker
//! 6. worker alone
//! 7. nothing matched: unmanaged, not an error

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use machina_common::crd::{MachineConfigPool, PoolRole};
use machina_common::{Error, Result, OS_LABEL, WINDOWS_OS_VALUE};

/// Pools a node resolved to, effective pool first
#[derive(Clone, Debug, PartialEq)]
pub struct PoolAssignment {
    pools: Vec<MachineConfigPool>,
    masked_custom: bool,
}

impl PoolAssignment {
    /// The authoritative pool for the node
    pub fn effective(&self) -> &MachineConfigPool {
        // constructed non-empty in resolve_pools
        &self.pools[0]
    }

    /// Informational second match, if any
    pub fn secondary(&self) -> Option<&MachineConfigPool> {
        self.pools.get(1)
    }

    /// All matched pools in precedence order (at most three)
    pub fn pools(&self) -> &[MachineConfigPool] {
        &self.pools
    }

    /// Names of the matched pools in precedence order
    pub fn names(&self) -> Vec<String> {
        self.pools.iter().map(|p| p.name_any()).collect()
    }

    /// True when the master pool masked a custom pool match
    pub fn masked_custom(&self) -> bool {
        self.masked_custom
    }
}

/// Check if a node runs Windows. A node without the OS label is Linux.
pub fn is_windows(node: &Node) -> bool {
    node.labels().get(OS_LABEL).map(String::as_str) == Some(WINDOWS_OS_VALUE)
}

/// Resolve the pools a node belongs to.
///
/// Returns `Ok(None)` for unmanaged nodes (Windows, or no pool matches) and an
/// [`Error::AmbiguousPool`] when more than one custom pool matches.
pub fn resolve_pools(node: &Node, pools: &[MachineConfigPool]) -> Result<Option<PoolAssignment>> {
    let node_name = node.name_any();

    if is_windows(node) {
        debug!(node = %node_name, "windows node is not managed by any pool");
        return Ok(None);
    }

    let labels: &BTreeMap<String, String> = node.labels();

    let mut master = None;
    let mut worker = None;
    let mut custom = Vec::new();
    for pool in pools.iter().filter(|p| p.selects(labels)) {
        match pool.role() {
            PoolRole::Master => master = Some(pool),
            PoolRole::Worker => worker = Some(pool),
            PoolRole::Custom => custom.push(pool),
        }
    }

    if custom.len() > 1 {
        return Err(Error::ambiguous_pool(node_name, custom.len()));
    }

    let mut masked_custom = false;
    let ordered: Vec<&MachineConfigPool> = match (custom.first(), master) {
        (Some(custom), Some(master)) => {
            info!(
                node = %node_name,
                custom_pool = %custom.name_any(),
                "node matches master and a custom pool, defaulting to master; custom role configuration will not apply"
            );
            masked_custom = true;
            [Some(master), Some(*custom), worker].into_iter().flatten().collect()
        }
        (Some(custom), None) => [Some(*custom), worker].into_iter().flatten().collect(),
        (None, Some(master)) => vec![master],
        (None, None) => worker.into_iter().collect(),
    };

    if ordered.is_empty() {
        return Ok(None);
    }

    Ok(Some(PoolAssignment {
        pools: ordered.into_iter().cloned().collect(),
        masked_custom,
    }))
}

/// The effective pool for a node, if it is managed
pub fn primary_pool_for_node(
    node: &Node,
    pools: &[MachineConfigPool],
) -> Result<Option<MachineConfigPool>> {
    Ok(resolve_pools(node, pools)?.map(|a| a.effective().clone()))
}

/// Nodes selected by `pool` whose effective pool is `pool`.
///
/// Nodes that fail resolution are skipped with a warning so one ambiguous
/// node does not hide the rest of the pool.
pub fn nodes_for_pool(
    pool: &MachineConfigPool,
    nodes: &[Node],
    pools: &[MachineConfigPool],
) -> Vec<Node> {
    let pool_name = pool.name_any();
    nodes
        .iter()
        .filter(|node| pool.selects(node.labels()))
        .filter(|node| match primary_pool_for_node(node, pools) {
            Ok(Some(primary)) => primary.name_any() == pool_name,
            Ok(None) => false,
            Err(e) => {
                warn!(node = %node.name_any(), pool = %pool_name, error = %e, "skipping node");
                false
            }
        })
        .cloned()
        .collect()
}
