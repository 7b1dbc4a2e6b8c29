//! Component health events
//!
//! Components report progress as core/v1 Events in the operator namespace.
//! The `source.component` field names the reporting component (see
//! [`ComponentKind::event_source`]) and the `node` annotation names the node
//! the event is about. The state aggregator watches these events and folds
//! them into MachineState records.
//!
//! Publishing is fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break an update.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::crd::ComponentKind;
use crate::{NODE_ANNOTATION, OPERATOR_NAMESPACE};

/// A component event as consumed by the state aggregator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentEvent {
    /// Human-readable message; used as the progression phase
    pub message: String,
    /// Machine-readable reason
    pub reason: String,
    /// Event annotations (the `node` annotation names the subject node)
    pub annotations: BTreeMap<String, String>,
}

impl ComponentEvent {
    /// Build an event about a node
    pub fn for_node(node: &str, message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: reason.into(),
            annotations: BTreeMap::from([(NODE_ANNOTATION.to_string(), node.to_string())]),
        }
    }

    /// Node named by the `node` annotation, if any
    pub fn node(&self) -> Option<&str> {
        self.annotations.get(NODE_ANNOTATION).map(String::as_str)
    }

    /// Extract the fields the aggregator needs from a core/v1 Event
    pub fn from_event(event: &Event) -> Self {
        Self {
            message: event.message.clone().unwrap_or_default(),
            reason: event.reason.clone().unwrap_or_default(),
            annotations: event.metadata.annotations.clone().unwrap_or_default(),
        }
    }

    /// Render as a core/v1 Event emitted by the given component
    pub fn to_event(&self, kind: ComponentKind, namespace: &str) -> Event {
        let now = Time(Utc::now());
        Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", kind.event_source())),
                namespace: Some(namespace.to_string()),
                annotations: Some(self.annotations.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("Node".to_string()),
                name: self.node().map(str::to_string),
                ..Default::default()
            },
            message: Some(self.message.clone()),
            reason: Some(self.reason.clone()),
            source: Some(EventSource {
                component: Some(kind.event_source().to_string()),
                host: self.node().map(str::to_string),
            }),
            type_: Some("Normal".to_string()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        }
    }
}

/// Publishes component events
#[async_trait]
pub trait ComponentEventPublisher: Send + Sync {
    /// Publish an event on behalf of a component. Never fails.
    async fn publish(&self, kind: ComponentKind, event: &ComponentEvent);
}

/// Publisher that creates core/v1 Events through the API server
pub struct KubeComponentEventPublisher {
    api: Api<Event>,
    namespace: String,
}

impl KubeComponentEventPublisher {
    /// Publisher for the default operator namespace
    pub fn new(client: Client) -> Self {
        Self::with_namespace(client, OPERATOR_NAMESPACE)
    }

    /// Publisher for an explicit namespace
    pub fn with_namespace(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl ComponentEventPublisher for KubeComponentEventPublisher {
    async fn publish(&self, kind: ComponentKind, event: &ComponentEvent) {
        let ev = event.to_event(kind, &self.namespace);
        match self.api.create(&PostParams::default(), &ev).await {
            Ok(_) => debug!(source = kind.event_source(), reason = %event.reason, "published component event"),
            Err(e) => warn!(
                source = kind.event_source(),
                reason = %event.reason,
                error = %e,
                "Failed to publish component event"
            ),
        }
    }
}

/// No-op implementation for tests and dry runs
pub struct NoopComponentEventPublisher;

#[async_trait]
impl ComponentEventPublisher for NoopComponentEventPublisher {
    async fn publish(&self, _kind: ComponentKind, _event: &ComponentEvent) {}
}

/// Well-known event reason strings
pub mod reasons {
    /// An OS update attempt started
    pub const UPDATE_STARTED: &str = "UpdateStarted";
    /// An OS update attempt finished successfully
    pub const UPDATE_COMPLETE: &str = "UpdateComplete";
    /// An OS update attempt failed
    pub const UPDATE_FAILED: &str = "UpdateFailed";
}
