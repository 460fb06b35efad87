use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::Client;
use tracing::{debug, instrument};

use super::{ApplyParams, ObjectStore, Registry};
use crate::error::{Error, Result};
use crate::object::{ObjectKey, ObjectRef, TypeRef};

/// Default deadline for a single API call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ObjectStore`] backed by the Kubernetes API.
///
/// Apply is server-side apply. Every call is bounded by the configured
/// request timeout; a call that runs out of time fails with
/// [`Error::Timeout`].
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<Registry>,
    timeout: Duration,
}

impl KubeStore {
    /// Create a store using `registry` to map types onto API endpoints.
    pub fn new(client: Client, registry: Arc<Registry>) -> Self {
        KubeStore {
            client,
            registry,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn api(&self, type_ref: &TypeRef, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let info = self
            .bounded(type_ref, async {
                self.registry.resolve(&self.client, type_ref).await
            })
            .await?;
        let client = self.client.clone();
        let api = match (info.namespaced, namespace) {
            (true, Some(namespace)) => Api::namespaced_with(client, namespace, &info.api_resource),
            (true, None) => Api::default_namespaced_with(client, &info.api_resource),
            (false, _) => Api::all_with(client, &info.api_resource),
        };
        Ok(api)
    }

    async fn bounded<T, F>(&self, what: impl Display, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(self.timeout, what, call).await
    }
}

async fn bounded<T, F>(timeout: Duration, what: impl Display, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%what, ?timeout, "request timed out");
            Err(Error::Timeout(timeout))
        }
    }
}

fn patch_params(params: &ApplyParams) -> PatchParams {
    let mut patch_params = PatchParams::apply(&params.field_manager);
    patch_params.force = params.force;
    patch_params.dry_run = params.dry_run;
    patch_params
}

/// Map a client error onto the store error classes.
pub(crate) fn classify(error: kube::Error, what: impl Display) -> Error {
    match error {
        kube::Error::Api(response) => match response.code {
            404 => Error::NotFound(what.to_string()),
            409 if response.reason == "AlreadyExists" => Error::AlreadyExists(what.to_string()),
            409 => Error::Conflict(what.to_string()),
            429 | 500..=599 => Error::Store(format!("{}: {}", what, response.message)),
            _ => Error::Kube(kube::Error::Api(response)),
        },
        other => Error::Kube(other),
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    #[instrument(level = "trace", skip(self))]
    async fn get(&self, type_ref: &TypeRef, key: &ObjectKey) -> Result<DynamicObject> {
        let api = self.api(type_ref, key.namespace()).await?;
        let what = format!("{} {}", type_ref, key);
        self.bounded(&what, async {
            api.get(key.name()).await.map_err(|e| classify(e, &what))
        })
        .await
    }

    #[instrument(level = "trace", skip(self, object), fields(object = ?object.metadata.name))]
    async fn apply(&self, object: &DynamicObject, params: &ApplyParams) -> Result<DynamicObject> {
        let object_ref = ObjectRef::of_dynamic(object)?;
        let api = self
            .api(&object_ref.type_ref, object_ref.key.namespace())
            .await?;
        let patch_params = patch_params(params);
        self.bounded(&object_ref, async {
            api.patch(object_ref.key.name(), &patch_params, &Patch::Apply(object))
                .await
                .map_err(|e| classify(e, &object_ref))
        })
        .await
    }

    #[instrument(level = "trace", skip(self, object), fields(object = ?object.metadata.name))]
    async fn apply_status(
        &self,
        object: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject> {
        let object_ref = ObjectRef::of_dynamic(object)?;
        let api = self
            .api(&object_ref.type_ref, object_ref.key.namespace())
            .await?;
        let patch_params = patch_params(params);
        self.bounded(&object_ref, async {
            api.patch_status(object_ref.key.name(), &patch_params, &Patch::Apply(object))
                .await
                .map_err(|e| classify(e, &object_ref))
        })
        .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn delete(&self, type_ref: &TypeRef, key: &ObjectKey) -> Result<()> {
        let api = self.api(type_ref, key.namespace()).await?;
        let what = format!("{} {}", type_ref, key);
        self.bounded(&what, async {
            api.delete(key.name(), &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(|e| classify(e, &what))
        })
        .await
    }
}
