//! Access to the declarative object store.
//!
//! The reconciler never talks to the Kubernetes API directly. Everything goes
//! through [`ObjectStore`], which is implemented by [`KubeStore`] for a real
//! cluster and by [`MemoryStore`] for tests and offline runs.

use kube::api::DynamicObject;

use crate::error::Result;
use crate::object::{ObjectKey, TypeRef};

mod kube_store;
mod memory;
mod registry;

pub use self::kube_store::{KubeStore, DEFAULT_REQUEST_TIMEOUT};
pub use memory::{FailOn, MemoryStore};
pub use registry::{Registry, ResourceInfo};

/// Options for an idempotent upsert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyParams {
    /// Identity that claims ownership of the applied fields.
    pub field_manager: String,
    /// Take ownership of fields currently owned by another manager.
    pub force: bool,
    /// Validate and resolve the object without persisting it.
    pub dry_run: bool,
}

impl ApplyParams {
    /// Forced apply under `field_manager`.
    pub fn forced(field_manager: impl Into<String>) -> Self {
        ApplyParams {
            field_manager: field_manager.into(),
            force: true,
            dry_run: false,
        }
    }

    /// Non-forced apply under `field_manager`.
    pub fn owned(field_manager: impl Into<String>) -> Self {
        ApplyParams {
            field_manager: field_manager.into(),
            force: false,
            dry_run: false,
        }
    }

    /// The same parameters in dry-run mode.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Get, upsert and delete arbitrary objects.
///
/// Implementations report missing objects as [`crate::Error::NotFound`], lost
/// create races as [`crate::Error::AlreadyExists`] and stale resource versions
/// as [`crate::Error::Conflict`].
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the current state of an object.
    async fn get(&self, type_ref: &TypeRef, key: &ObjectKey) -> Result<DynamicObject>;

    /// Upsert `object`, claiming the fields it sets. Returns the stored object.
    ///
    /// If `metadata.resourceVersion` is set the write only succeeds when it
    /// matches the stored version.
    async fn apply(&self, object: &DynamicObject, params: &ApplyParams) -> Result<DynamicObject>;

    /// Upsert the `status` of `object` only. All other fields are ignored.
    async fn apply_status(
        &self,
        object: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject>;

    /// Request deletion of an object.
    async fn delete(&self, type_ref: &TypeRef, key: &ObjectKey) -> Result<()>;
}
