//! Kubernetes Events reporting installation progress.
//!
//! Events are fire-and-forget: a failed publish is logged and never affects
//! reconciliation.

use std::fmt;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource};
use tokio::sync::Mutex;
use tracing::warn;

/// Reason of the event emitted after a status write succeeded.
pub const REASON_STATUS_UPDATED: &str = "StatusUpdated";
/// Reason of the event emitted after a status write failed.
pub const REASON_STATUS_UPDATE_FAILED: &str = "ErrorUpdatingStatus";

/// Reason of the event emitted when rendered objects could not be applied.
pub const REASON_RESOURCES_INSTALL: &str = "ResourcesInstall";
/// Reason of the event emitted when rendered objects could not be deleted.
pub const REASON_RESOURCES_DELETE: &str = "ResourcesDelete";

/// Severity of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Expected progress.
    Normal,
    /// Something needs attention.
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// Publishes events about a resource.
#[async_trait::async_trait]
pub trait Recorder: Send + Sync {
    /// Publish an event. Never fails; implementations log their own errors.
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    );
}

/// Reference to `resource` suitable for an event's `involvedObject`.
pub fn object_reference<K: Resource<DynamicType = ()>>(resource: &K) -> ObjectReference {
    let meta = resource.meta();
    ObjectReference {
        api_version: Some(K::api_version(&()).into_owned()),
        kind: Some(K::kind(&()).into_owned()),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        uid: meta.uid.clone(),
        resource_version: meta.resource_version.clone(),
        ..Default::default()
    }
}

/// Creates `core/v1` Event objects through the API.
pub struct KubeRecorder {
    client: Client,
    component: String,
}

impl KubeRecorder {
    /// `component` is reported as the event source.
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        KubeRecorder {
            client,
            component: component.into(),
        }
    }

    fn event(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Event {
        let now = Time(Utc::now());
        let name = regarding.name.clone().unwrap_or_default();
        Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", name)),
                namespace: regarding.namespace.clone(),
                ..Default::default()
            },
            involved_object: regarding.clone(),
            type_: Some(type_.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            reporting_component: Some(self.component.clone()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Recorder for KubeRecorder {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let namespace = regarding.namespace.as_deref().unwrap_or("default");
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let event = self.event(regarding, type_, reason, message);
        if let Err(e) = api.create(&PostParams::default(), &event).await {
            warn!(
                reason,
                object = ?regarding.name,
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// An event kept by [`MemoryRecorder`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Object the event is about.
    pub regarding: ObjectReference,
    /// Severity.
    pub type_: EventType,
    /// Machine readable reason.
    pub reason: String,
    /// Human readable message.
    pub message: String,
}

/// Keeps events in memory.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, oldest first.
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Recorder for MemoryRecorder {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events.lock().await.push(RecordedEvent {
            regarding: regarding.clone(),
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::{Sample, SampleSpec};

    fn sample() -> Sample {
        let mut sample = Sample::new("kyma-sample", SampleSpec::default());
        sample.metadata.namespace = Some("default".to_string());
        sample.metadata.uid = Some("1234".to_string());
        sample
    }

    #[test]
    fn reference_carries_type_and_identity() {
        let reference = object_reference(&sample());
        assert_eq!(
            reference.api_version.as_deref(),
            Some("operator.template.dev/v1alpha1")
        );
        assert_eq!(reference.kind.as_deref(), Some("Sample"));
        assert_eq!(reference.name.as_deref(), Some("kyma-sample"));
        assert_eq!(reference.uid.as_deref(), Some("1234"));
    }

    #[tokio::test]
    async fn memory_recorder_keeps_order() {
        let recorder = MemoryRecorder::new();
        let reference = object_reference(&sample());
        recorder
            .publish(&reference, EventType::Normal, REASON_STATUS_UPDATED, "updating state to Processing")
            .await;
        recorder
            .publish(&reference, EventType::Warning, REASON_STATUS_UPDATE_FAILED, "updating state to Ready")
            .await;
        let events = recorder.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].type_, EventType::Normal);
        assert_eq!(events[1].reason, "ErrorUpdatingStatus");
    }
}
