use std::collections::HashMap;

use kube::api::GroupVersionKind;
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::{Client, Resource};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::object::TypeRef;

/// How to reach a type through the API.
#[derive(Clone, Debug)]
pub struct ResourceInfo {
    /// Group, version, kind and plural of the type.
    pub api_resource: ApiResource,
    /// Whether objects of the type live in a namespace.
    pub namespaced: bool,
}

/// Explicit type registry shared by the store adapters.
///
/// Types are either registered up front or resolved through API discovery
/// the first time they are used. Resolved types are cached.
#[derive(Default)]
pub struct Registry {
    resources: RwLock<HashMap<TypeRef, ResourceInfo>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type explicitly.
    pub async fn register(&self, type_ref: TypeRef, info: ResourceInfo) {
        self.resources.write().await.insert(type_ref, info);
    }

    /// Register a statically known kind.
    pub async fn register_kind<K: Resource<DynamicType = ()>>(&self, namespaced: bool) {
        self.register(
            TypeRef::of::<K>(),
            ResourceInfo {
                api_resource: ApiResource::erase::<K>(&()),
                namespaced,
            },
        )
        .await
    }

    /// Look up a registered or previously resolved type.
    pub async fn lookup(&self, type_ref: &TypeRef) -> Option<ResourceInfo> {
        self.resources.read().await.get(type_ref).cloned()
    }

    /// Look up a type, running discovery against the API server on a miss.
    pub async fn resolve(&self, client: &Client, type_ref: &TypeRef) -> Result<ResourceInfo> {
        if let Some(info) = self.lookup(type_ref).await {
            return Ok(info);
        }

        let (group, version) = type_ref.group_version();
        let gvk = GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: type_ref.kind.clone(),
        };
        debug!(%type_ref, "resolving type through discovery");
        let discovery = Discovery::new(client.clone())
            .filter(&[group])
            .run()
            .await?;
        let (api_resource, capabilities) = discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| Error::NotFound(format!("type {}", type_ref)))?;
        let info = ResourceInfo {
            api_resource,
            namespaced: matches!(capabilities.scope, Scope::Namespaced),
        };
        self.register(type_ref.clone(), info.clone()).await;
        Ok(info)
    }
}
