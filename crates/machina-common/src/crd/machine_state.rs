//! MachineState CRD: the durable per-component status record
//!
//! There is exactly one MachineState per [`ComponentKind`], named after the
//! kind. Its status holds an append-only progression history and a table of
//! the most recent lifecycle state observed for each node. Only the state
//! controller writes status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Component whose health/progress a MachineState aggregates
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    /// The cluster-level config controller
    Controller,
    /// The per-node update daemon
    Daemon,
    /// The config server handing out initial configs
    Server,
    /// Metrics registration requests
    Metrics,
    /// Free-form upgrade progression phases
    UpgradeProgression,
    /// Free-form operator progression phases
    OperatorProgression,
}

/// How a component kind turns an incoming event phase into a lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleRule {
    /// Every event maps to the same fixed state token
    Fixed(&'static str),
    /// The event phase is used verbatim as the state
    Passthrough,
}

impl LifecycleRule {
    /// Apply the rule to an incoming phase
    pub fn state_for(&self, phase: &str) -> String {
        match self {
            LifecycleRule::Fixed(token) => (*token).to_string(),
            LifecycleRule::Passthrough => phase.to_string(),
        }
    }
}

impl ComponentKind {
    /// All kinds, in the order their watchers are started
    pub const ALL: [ComponentKind; 6] = [
        ComponentKind::Controller,
        ComponentKind::Daemon,
        ComponentKind::Server,
        ComponentKind::Metrics,
        ComponentKind::UpgradeProgression,
        ComponentKind::OperatorProgression,
    ];

    /// Name of the MachineState record for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Controller => "controller",
            ComponentKind::Daemon => "daemon",
            ComponentKind::Server => "server",
            ComponentKind::Metrics => "metrics",
            ComponentKind::UpgradeProgression => "upgrade-progression",
            ComponentKind::OperatorProgression => "operator-progression",
        }
    }

    /// Value of the core/v1 Event `source` field this kind's watcher filters on
    pub fn event_source(&self) -> &'static str {
        match self {
            ComponentKind::Controller => "mcc-health",
            ComponentKind::Daemon => "mcd-health",
            ComponentKind::Server => "mcs-health",
            ComponentKind::Metrics => "metrics",
            ComponentKind::UpgradeProgression => "upgrade-health",
            ComponentKind::OperatorProgression => "operator-health",
        }
    }

    /// Lifecycle mapping for this kind
    pub fn lifecycle(&self) -> LifecycleRule {
        match self {
            ComponentKind::Controller => LifecycleRule::Fixed("ControllerSync"),
            ComponentKind::Daemon => LifecycleRule::Fixed("DaemonSync"),
            ComponentKind::Server => LifecycleRule::Fixed("ServerSync"),
            ComponentKind::Metrics => LifecycleRule::Fixed("MetricsSync"),
            ComponentKind::UpgradeProgression | ComponentKind::OperatorProgression => {
                LifecycleRule::Passthrough
            }
        }
    }

    /// Look up a kind by record name
    pub fn from_record_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MachineState aggregates the status of one component across all nodes.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machineconfiguration.machina.dev",
    version = "v1",
    kind = "MachineState",
    plural = "machinestates",
    status = "MachineStateStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineStateSpec {
    /// Component this record aggregates
    pub kind: ComponentKind,
}

/// Phase and reason reported with a progression entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ProgressionCondition {
    /// Phase (the event message)
    pub phase: String,
    /// Machine-readable reason
    pub reason: String,
}

/// A lifecycle state observed on a node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateOnNode {
    /// Lifecycle state token
    pub state: String,
    /// Node the state was observed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// When the state was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// One entry of the progression history
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionEntry {
    /// Composite key: state, node and observation time
    #[serde(flatten)]
    pub on_node: StateOnNode,
    /// Condition recorded for this key
    pub condition: ProgressionCondition,
}

/// Status of a MachineState
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStateStatus {
    /// Progression history in event arrival order
    #[serde(default)]
    pub progression: Vec<ProgressionEntry>,
    /// Latest state per node; at most one entry per node
    #[serde(default)]
    pub most_recent_state: Vec<StateOnNode>,
}

impl MachineState {
    /// Build an empty record for a component kind
    pub fn for_kind(kind: ComponentKind) -> Self {
        let mut ms = MachineState::new(kind.as_str(), MachineStateSpec { kind });
        ms.status = Some(MachineStateStatus::default());
        ms
    }
}
