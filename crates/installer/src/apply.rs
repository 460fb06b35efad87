//! Idempotent installation and removal of rendered objects.

use std::sync::Arc;

use futures::{stream, StreamExt};
use kube::api::DynamicObject;
use tracing::{debug, warn};

use crate::error::{AggregateError, Error, Result};
use crate::object::ObjectRef;
use crate::render::RenderedSet;
use crate::store::{ApplyParams, ObjectStore};

/// Upserts and deletes the objects of a [`RenderedSet`].
///
/// Per-object failures never short-circuit the pass; they are collected
/// into an [`AggregateError`] in manifest order.
#[derive(Clone)]
pub struct ApplyPipeline {
    store: Arc<dyn ObjectStore>,
    field_manager: String,
    concurrency: usize,
}

impl ApplyPipeline {
    /// Apply under the `field_manager` identity, one object at a time.
    pub fn new(store: Arc<dyn ObjectStore>, field_manager: impl Into<String>) -> Self {
        ApplyPipeline {
            store,
            field_manager: field_manager.into(),
            concurrency: 1,
        }
    }

    /// Run up to `concurrency` store calls at once. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Upsert every object, forcing ownership of the fields we set.
    ///
    /// A create that lost a race (`AlreadyExists`) counts as success.
    pub async fn apply(&self, rendered: &RenderedSet) -> Result<()> {
        if !rendered.raw_blobs.is_empty() {
            debug!(
                count = rendered.raw_blobs.len(),
                "skipping documents that are not objects"
            );
        }
        let params = ApplyParams::forced(self.field_manager.clone());
        let pending: Vec<_> = rendered
            .objects
            .iter()
            .map(|object| self.apply_one(object, &params))
            .collect();
        let results: Vec<Result<()>> = stream::iter(pending)
            .buffered(self.concurrency)
            .collect()
            .await;
        collect_errors(results)
    }

    /// Delete every object. Objects that are already gone count as deleted.
    pub async fn delete(&self, rendered: &RenderedSet) -> Result<()> {
        let pending: Vec<_> = rendered
            .objects
            .iter()
            .map(|object| self.delete_one(object))
            .collect();
        let results: Vec<Result<()>> = stream::iter(pending)
            .buffered(self.concurrency)
            .collect()
            .await;
        collect_errors(results)
    }

    async fn apply_one(&self, object: &DynamicObject, params: &ApplyParams) -> Result<()> {
        let object_ref = ObjectRef::of_dynamic(object)?;
        match self.store.apply(object, params).await {
            Ok(_) => {
                debug!(object = %object_ref, "applied");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(object = %object_ref, "already exists");
                Ok(())
            }
            Err(e) => {
                warn!(object = %object_ref, error = %e, "apply failed");
                Err(e)
            }
        }
    }

    async fn delete_one(&self, object: &DynamicObject) -> Result<()> {
        let object_ref = ObjectRef::of_dynamic(object)?;
        match self.store.delete(&object_ref.type_ref, &object_ref.key).await {
            Ok(()) => {
                debug!(object = %object_ref, "deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(object = %object_ref, "already deleted");
                Ok(())
            }
            Err(e) => {
                warn!(object = %object_ref, error = %e, "delete failed");
                Err(e)
            }
        }
    }
}

fn collect_errors(results: Vec<Result<()>>) -> Result<()> {
    let errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
    AggregateError::from(errors).into_result()
}
