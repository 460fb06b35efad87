//! Persisting the observed state of an installation.

use std::sync::Arc;

use kube::api::DynamicObject;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{
    object_reference, EventType, Recorder, REASON_STATUS_UPDATED, REASON_STATUS_UPDATE_FAILED,
};
use crate::object::TypeRef;
use crate::resource::{ConditionStatus, Installation, InstallationStatus, State};
use crate::store::{ApplyParams, ObjectStore};

/// Writes `status` and `metadata.finalizers` of installations.
///
/// Writes carry the `resourceVersion` the resource was read at, so a
/// concurrent edit makes them fail with [`Error::Conflict`] instead of
/// silently overwriting it.
#[derive(Clone)]
pub struct StatusManager {
    store: Arc<dyn ObjectStore>,
    recorder: Arc<dyn Recorder>,
    field_manager: String,
}

impl StatusManager {
    /// Write under the `field_manager` identity and report to `recorder`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        recorder: Arc<dyn Recorder>,
        field_manager: impl Into<String>,
    ) -> Self {
        StatusManager {
            store,
            recorder,
            field_manager: field_manager.into(),
        }
    }

    /// Persist `state` and the installation condition.
    ///
    /// Nothing is written (and no event is emitted) if the resource already
    /// carries exactly this status. Otherwise one event is published whether
    /// the write succeeds or not.
    pub async fn set_status<K: Installation>(
        &self,
        resource: &K,
        state: State,
        condition: ConditionStatus,
    ) -> Result<()> {
        let current = resource.installation_status().cloned().unwrap_or_default();
        let desired = current
            .clone()
            .with_state(state)
            .with_installation_condition(condition, resource.meta().generation);
        if desired == current {
            debug!(%state, "status unchanged");
            return Ok(());
        }

        let patch = status_patch(resource, &desired)?;
        let regarding = object_reference(resource);
        let message = format!("updating state to {}", state);
        match self
            .store
            .apply_status(&patch, &ApplyParams::owned(self.field_manager.clone()))
            .await
        {
            Ok(_) => {
                info!(from = %current.state, to = %state, "state updated");
                self.recorder
                    .publish(&regarding, EventType::Normal, REASON_STATUS_UPDATED, &message)
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(%state, error = %e, "could not update status");
                self.recorder
                    .publish(
                        &regarding,
                        EventType::Warning,
                        REASON_STATUS_UPDATE_FAILED,
                        &message,
                    )
                    .await;
                Err(Error::Persistence {
                    state,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Replace the finalizer list of `resource`. Only metadata is written.
    pub async fn set_finalizers<K: Installation>(
        &self,
        resource: &K,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let state = resource
            .installation_status()
            .map(|s| s.state)
            .unwrap_or_default();
        let patch = metadata_patch(resource, json!({ "finalizers": finalizers }))?;
        self.store
            .apply(&patch, &ApplyParams::forced(self.field_manager.clone()))
            .await
            .map(|_| ())
            .map_err(|e| Error::Persistence {
                state,
                source: Box::new(e),
            })
    }
}

fn metadata_patch<K: Installation>(
    resource: &K,
    extra_metadata: serde_json::Value,
) -> Result<DynamicObject> {
    let type_ref = TypeRef::of::<K>();
    let meta = resource.meta();
    let mut patch = json!({
        "apiVersion": type_ref.api_version,
        "kind": type_ref.kind,
        "metadata": {
            "name": meta.name,
            "namespace": meta.namespace,
            "resourceVersion": meta.resource_version,
        },
    });
    json_patch::merge(&mut patch["metadata"], &extra_metadata);
    Ok(serde_json::from_value(patch)?)
}

fn status_patch<K: Installation>(
    resource: &K,
    status: &InstallationStatus,
) -> Result<DynamicObject> {
    let mut patch = metadata_patch(resource, json!({}))?;
    patch.data["status"] = serde_json::to_value(status)?;
    Ok(patch)
}
