//! Folding component events into MachineState records
//!
//! Status writes are best-effort: a record that cannot be read, a node that
//! cannot be resolved, or a write that loses an optimistic-concurrency race
//! is logged and dropped. The next event for the component writes again.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, warn};

use machina_common::crd::{
    ComponentKind, MachineState, ProgressionCondition, ProgressionEntry, StateOnNode,
};
use machina_common::{Result, NODE_ANNOTATION};

use crate::store::StateStore;

/// Writes status and spec of MachineState records
#[derive(Clone)]
pub struct StatusWriter {
    store: Arc<dyn StateStore>,
}

impl StatusWriter {
    /// Writer backed by `store`
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Record a component event on the record for `kind`.
    ///
    /// Never fails; every problem is logged.
    pub async fn write_status(
        &self,
        kind: ComponentKind,
        phase: &str,
        reason: &str,
        annotations: &BTreeMap<String, String>,
    ) {
        let record = kind.as_str();
        let current = match self.store.get_state(record).await {
            Ok(state) => state,
            Err(e) => {
                warn!(record, error = %e, "failed to fetch MachineState, dropping event");
                return;
            }
        };

        let state = kind.lifecycle().state_for(phase);
        let Some(node) = self.resolve_node(&current, annotations).await else {
            return;
        };

        let updated = apply_observation(current, &state, &node, phase, reason);
        match self.store.update_status(&updated).await {
            Ok(_) => debug!(record, node = %node, state = %state, "recorded component state"),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(record, error = %e, "MachineState changed underneath us, dropping event")
            }
            Err(e) => warn!(record, error = %e, "failed to update MachineState status"),
        }
    }

    /// Node the observation belongs to.
    ///
    /// The `node` annotation wins: a node the record already tracks is taken
    /// as is, a new one must exist in the cluster. An event without the
    /// annotation is credited to the first node the record tracks.
    async fn resolve_node(
        &self,
        current: &MachineState,
        annotations: &BTreeMap<String, String>,
    ) -> Option<String> {
        let tracked = current
            .status
            .as_ref()
            .map(|s| s.most_recent_state.as_slice())
            .unwrap_or_default();

        let Some(name) = annotations.get(NODE_ANNOTATION) else {
            let first = tracked.first().and_then(|s| s.node.clone());
            if first.is_none() {
                warn!(record = %current.name_any(), "event has no node annotation, dropping");
            }
            return first;
        };

        if tracked.iter().any(|s| s.node.as_deref() == Some(name.as_str())) {
            return Some(name.clone());
        }
        match self.store.get_node(name).await {
            Ok(node) => Some(node.name_any()),
            Err(e) => {
                warn!(record = %current.name_any(), node = %name, error = %e, "failed to look up node, dropping event");
                None
            }
        }
    }

    /// Persist a record's spec and metadata
    pub async fn write_spec(&self, state: &MachineState) -> Result<()> {
        self.store.update_spec(state).await.map(|_| ())
    }
}

/// Append a progression entry and update the node's most recent state
pub fn apply_observation(
    mut record: MachineState,
    state: &str,
    node: &str,
    phase: &str,
    reason: &str,
) -> MachineState {
    let now = Utc::now();
    let status = record.status.get_or_insert_with(Default::default);

    status.progression.push(ProgressionEntry {
        on_node: StateOnNode {
            state: state.to_string(),
            node: Some(node.to_string()),
            time: Some(now),
        },
        condition: ProgressionCondition {
            phase: phase.to_string(),
            reason: reason.to_string(),
        },
    });

    let latest = StateOnNode {
        state: state.to_string(),
        node: Some(node.to_string()),
        time: Some(now),
    };
    match status
        .most_recent_state
        .iter_mut()
        .find(|s| s.node.as_deref() == Some(node))
    {
        Some(existing) => *existing = latest,
        None => status.most_recent_state.push(latest),
    }

    record
}
