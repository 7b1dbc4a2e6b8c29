//! Pool resolution for Machina
//!
//! Decides which MachineConfigPool is authoritative for a node when pool
//! selectors overlap, and lists the nodes a pool actually owns.

#![deny(missing_docs)]

pub mod lister;
pub mod resolver;

pub use lister::{nodes_for_pool_name, pools_for_node_name, KubePoolLister, PoolLister};
pub use resolver::{
    is_windows, nodes_for_pool, primary_pool_for_node, resolve_pools, PoolAssignment,
};
