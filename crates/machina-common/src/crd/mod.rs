//! Custom Resource Definitions for Machina
//!
//! This module contains all CRD definitions used by the Machina controllers.

mod machine_state;
mod pool;
mod selector;

pub use machine_state::{
    ComponentKind, LifecycleRule, MachineState, MachineStateSpec, MachineStateStatus,
    ProgressionCondition, ProgressionEntry, StateOnNode,
};
pub use pool::{MachineConfigPool, MachineConfigPoolSpec, PoolRole};
pub use selector::{LabelSelectorOperator, LabelSelectorRequirement, NodeSelector};
