use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use kube::api::DynamicObject;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::trace;

use super::{ApplyParams, ObjectStore};
use crate::error::{Error, Result};
use crate::object::{ObjectKey, ObjectRef, TypeRef};
use crate::util::{concrete_object, dynamic_object};

type ResourceMap = HashMap<TypeRef, HashMap<ObjectKey, Value>>;
type Failure = Box<dyn Fn() -> Error + Send + Sync>;

/// Store operation that an injected failure applies to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum FailOn {
    /// [`ObjectStore::get`].
    Get,
    /// [`ObjectStore::apply`].
    Apply,
    /// [`ObjectStore::apply_status`].
    ApplyStatus,
    /// [`ObjectStore::delete`].
    Delete,
}

/// In-process object store.
///
/// * Collections are scoped by {apiVersion, kind, namespace, name}.
/// * Apply is a JSON merge patch guarded by `metadata.resourceVersion`.
/// * Writes that change nothing keep the resource version.
/// * Deleting an object with finalizers only sets `deletionTimestamp` and
///   bumps `generation`; the object is removed once its finalizers are
///   cleared.
///
/// ```
/// # use installer::store::{MemoryStore, ObjectStore};
/// # use installer::{ObjectKey, TypeRef};
/// # use k8s_openapi::api::core::v1::ConfigMap;
/// #
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let store = MemoryStore::new();
/// let mut config_map = ConfigMap::default();
/// config_map.metadata.name = Some("greeter".to_string());
/// config_map.metadata.namespace = Some("default".to_string());
/// store.create_typed(&config_map).await?;
///
/// let key = ObjectKey::namespaced("default", "greeter");
/// let fetched: ConfigMap = store.get_as(&key).await?;
/// assert_eq!(fetched.metadata.generation, Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<ResourceMap>,
    failures: RwLock<HashMap<(FailOn, TypeRef, ObjectKey), Failure>>,
    versions: AtomicU64,
}

impl MemoryStore {
    /// Initialize empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `operation` on the given object fail with the error built
    /// by `failure`, until [`MemoryStore::clear_failures`] is called.
    pub async fn fail_on<F>(&self, operation: FailOn, type_ref: TypeRef, key: ObjectKey, failure: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        self.failures
            .write()
            .await
            .insert((operation, type_ref, key), Box::new(failure));
    }

    /// Remove all injected failures.
    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    async fn injected(&self, operation: FailOn, type_ref: &TypeRef, key: &ObjectKey) -> Result<()> {
        let failures = self.failures.read().await;
        match failures.get(&(operation, type_ref.clone(), key.clone())) {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Create an object. Fails with [`Error::AlreadyExists`] if it exists.
    pub async fn create(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let object_ref = ObjectRef::of_dynamic(object)?;
        let mut value = serde_json::to_value(object)?;
        let mut objects = self.objects.write().await;
        let collection = objects
            .entry(object_ref.type_ref.clone())
            .or_insert_with(HashMap::new);
        if collection.contains_key(&object_ref.key) {
            return Err(Error::AlreadyExists(object_ref.to_string()));
        }
        self.initialize(&mut value)?;
        collection.insert(object_ref.key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Create a typed object.
    pub async fn create_typed<R: Serialize>(&self, object: &R) -> Result<DynamicObject> {
        self.create(&dynamic_object(object)?).await
    }

    /// Fetch a typed object.
    pub async fn get_as<R>(&self, key: &ObjectKey) -> Result<R>
    where
        R: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let object = self.get(&TypeRef::of::<R>(), key).await?;
        concrete_object(object)
    }

    /// Whether the object exists. Ignores injected failures.
    pub async fn contains(&self, type_ref: &TypeRef, key: &ObjectKey) -> bool {
        self.objects
            .read()
            .await
            .get(type_ref)
            .map(|collection| collection.contains_key(key))
            .unwrap_or(false)
    }

    /// All objects of a type, ordered by key.
    pub async fn list(&self, type_ref: &TypeRef) -> Result<Vec<DynamicObject>> {
        let objects = self.objects.read().await;
        let mut entries: Vec<_> = objects
            .get(type_ref)
            .map(|collection| collection.iter().collect())
            .unwrap_or_default();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
            .into_iter()
            .map(|(_, value)| Ok(serde_json::from_value(value.clone())?))
            .collect()
    }

    /// Total number of objects across all types.
    pub async fn len(&self) -> usize {
        self.objects.read().await.values().map(HashMap::len).sum()
    }

    /// Whether the store holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn initialize(&self, value: &mut Value) -> Result<()> {
        let version = self.next_version();
        let metadata = metadata_mut(value)?;
        metadata.insert("uid".to_string(), Value::String(format!("uid-{}", version)));
        metadata.insert(
            "creationTimestamp".to_string(),
            Value::String(timestamp()),
        );
        metadata.insert("generation".to_string(), Value::from(1));
        metadata.insert("resourceVersion".to_string(), Value::String(version));
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, type_ref: &TypeRef, key: &ObjectKey) -> Result<DynamicObject> {
        self.injected(FailOn::Get, type_ref, key).await?;
        let objects = self.objects.read().await;
        match objects.get(type_ref).and_then(|collection| collection.get(key)) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(Error::NotFound(format!("{} {}", type_ref, key))),
        }
    }

    async fn apply(&self, object: &DynamicObject, params: &ApplyParams) -> Result<DynamicObject> {
        let object_ref = ObjectRef::of_dynamic(object)?;
        self.injected(FailOn::Apply, &object_ref.type_ref, &object_ref.key)
            .await?;

        let mut patch = serde_json::to_value(object)?;
        if let Some(patch) = patch.as_object_mut() {
            patch.remove("status");
        }
        let expected_version = take_resource_version(&mut patch)?;

        let mut objects = self.objects.write().await;
        let collection = objects
            .entry(object_ref.type_ref.clone())
            .or_insert_with(HashMap::new);

        let existing = match collection.get(&object_ref.key) {
            Some(existing) => existing,
            None => {
                if expected_version.is_some() {
                    return Err(Error::NotFound(object_ref.to_string()));
                }
                self.initialize(&mut patch)?;
                if !params.dry_run {
                    trace!(object = %object_ref, manager = %params.field_manager, "created");
                    collection.insert(object_ref.key, patch.clone());
                }
                return Ok(serde_json::from_value(patch)?);
            }
        };

        check_version(existing, expected_version.as_deref(), &object_ref)?;

        let mut merged = existing.clone();
        json_patch::merge(&mut merged, &patch);
        if merged == *existing {
            return Ok(serde_json::from_value(merged)?);
        }
        if spec_of(&merged) != spec_of(existing) {
            let generation = metadata(existing)
                .and_then(|m| m.get("generation"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            metadata_mut(&mut merged)?.insert("generation".to_string(), Value::from(generation + 1));
        }
        let version = self.next_version();
        metadata_mut(&mut merged)?.insert("resourceVersion".to_string(), Value::String(version));

        if params.dry_run {
            return Ok(serde_json::from_value(merged)?);
        }
        if is_deleting(&merged) && !has_finalizers(&merged) {
            trace!(object = %object_ref, "finalizers cleared, removing");
            collection.remove(&object_ref.key);
        } else {
            trace!(object = %object_ref, manager = %params.field_manager, "updated");
            collection.insert(object_ref.key, merged.clone());
        }
        Ok(serde_json::from_value(merged)?)
    }

    async fn apply_status(
        &self,
        object: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject> {
        let object_ref = ObjectRef::of_dynamic(object)?;
        self.injected(FailOn::ApplyStatus, &object_ref.type_ref, &object_ref.key)
            .await?;

        let mut patch = serde_json::to_value(object)?;
        let expected_version = take_resource_version(&mut patch)?;
        let status = patch.get("status").cloned().unwrap_or(Value::Null);

        let mut objects = self.objects.write().await;
        let existing = objects
            .get_mut(&object_ref.type_ref)
            .and_then(|collection| collection.get_mut(&object_ref.key))
            .ok_or_else(|| Error::NotFound(object_ref.to_string()))?;
        check_version(existing, expected_version.as_deref(), &object_ref)?;

        let mut merged = existing.clone();
        if let Some(merged) = merged.as_object_mut() {
            let current = merged.entry("status").or_insert(Value::Null);
            json_patch::merge(current, &status);
            if current.is_null() {
                merged.remove("status");
            }
        }
        if merged == *existing {
            return Ok(serde_json::from_value(merged)?);
        }
        let version = self.next_version();
        metadata_mut(&mut merged)?.insert("resourceVersion".to_string(), Value::String(version));
        if !params.dry_run {
            trace!(object = %object_ref, manager = %params.field_manager, "status updated");
            *existing = merged.clone();
        }
        Ok(serde_json::from_value(merged)?)
    }

    async fn delete(&self, type_ref: &TypeRef, key: &ObjectKey) -> Result<()> {
        self.injected(FailOn::Delete, type_ref, key).await?;
        let mut objects = self.objects.write().await;
        let collection = objects
            .get_mut(type_ref)
            .ok_or_else(|| Error::NotFound(format!("{} {}", type_ref, key)))?;
        let existing = collection
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("{} {}", type_ref, key)))?;

        if !has_finalizers(existing) {
            collection.remove(key);
            return Ok(());
        }
        if !is_deleting(existing) {
            let version = self.next_version();
            let generation = metadata(existing)
                .and_then(|m| m.get("generation"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let metadata = metadata_mut(existing)?;
            metadata.insert("deletionTimestamp".to_string(), Value::String(timestamp()));
            metadata.insert("generation".to_string(), Value::from(generation + 1));
            metadata.insert("resourceVersion".to_string(), Value::String(version));
        }
        Ok(())
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn metadata(value: &Value) -> Option<&Map<String, Value>> {
    value.get("metadata").and_then(Value::as_object)
}

fn metadata_mut(value: &mut Value) -> Result<&mut Map<String, Value>> {
    value
        .as_object_mut()
        .ok_or_else(|| Error::InvalidObject("object is not a map".to_string()))?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::InvalidObject("metadata is not a map".to_string()))
}

fn take_resource_version(patch: &mut Value) -> Result<Option<String>> {
    Ok(metadata_mut(patch)?
        .remove("resourceVersion")
        .and_then(|v| v.as_str().map(str::to_string)))
}

fn check_version(existing: &Value, expected: Option<&str>, object_ref: &ObjectRef) -> Result<()> {
    let current = metadata(existing)
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Value::as_str);
    match expected {
        Some(expected) if Some(expected) != current => Err(Error::Conflict(object_ref.to_string())),
        _ => Ok(()),
    }
}

fn spec_of(value: &Value) -> Option<&Value> {
    value.get("spec")
}

fn is_deleting(value: &Value) -> bool {
    metadata(value)
        .and_then(|m| m.get("deletionTimestamp"))
        .map(|t| !t.is_null())
        .unwrap_or(false)
}

fn has_finalizers(value: &Value) -> bool {
    metadata(value)
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use serde_json::json;

    fn config_map(name: &str, data: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default" },
            "data": data,
        }))
        .unwrap()
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    #[tokio::test]
    async fn apply_creates_then_is_a_noop() {
        let store = MemoryStore::new();
        let params = ApplyParams::forced("test");
        let object = config_map("cm", json!({ "a": "1" }));
        let first = store.apply(&object, &params).await.unwrap();
        let second = store.apply(&object, &params).await.unwrap();
        assert_eq!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn create_reports_already_exists() {
        let store = MemoryStore::new();
        let object = config_map("cm", json!({}));
        store.create(&object).await.unwrap();
        assert!(store.create(&object).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let params = ApplyParams::forced("test");
        let created = store
            .apply(&config_map("cm", json!({ "a": "1" })), &params)
            .await
            .unwrap();
        store
            .apply(&config_map("cm", json!({ "a": "2" })), &params)
            .await
            .unwrap();

        let mut stale = config_map("cm", json!({ "a": "3" }));
        stale.metadata.resource_version = created.metadata.resource_version;
        assert!(store.apply(&stale, &params).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn dry_run_does_not_persist() {
        let store = MemoryStore::new();
        let params = ApplyParams::forced("test").dry_run();
        let resolved = store
            .apply(&config_map("cm", json!({})), &params)
            .await
            .unwrap();
        assert!(resolved.metadata.uid.is_some());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        let params = ApplyParams::forced("test");
        let mut object = config_map("cm", json!({}));
        object.metadata.finalizers = Some(vec!["test/finalizer".to_string()]);
        store.apply(&object, &params).await.unwrap();

        store.delete(&TypeRef::new("v1", "ConfigMap"), &key("cm")).await.unwrap();
        let pending: ConfigMap = store.get_as(&key("cm")).await.unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());
        assert_eq!(pending.metadata.generation, Some(2));

        let mut cleared = config_map("cm", json!({}));
        cleared.metadata.finalizers = Some(vec![]);
        store.apply(&cleared, &params).await.unwrap();
        assert!(!store.contains(&TypeRef::new("v1", "ConfigMap"), &key("cm")).await);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .delete(&TypeRef::new("v1", "ConfigMap"), &key("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_failures_are_returned() {
        let store = MemoryStore::new();
        store
            .fail_on(FailOn::Apply, TypeRef::new("v1", "ConfigMap"), key("cm"), || {
                Error::Store("quota exceeded".to_string())
            })
            .await;
        let err = store
            .apply(&config_map("cm", json!({})), &ApplyParams::forced("test"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        store.clear_failures().await;
        assert!(store
            .apply(&config_map("cm", json!({})), &ApplyParams::forced("test"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn status_is_written_separately() {
        let store = MemoryStore::new();
        let params = ApplyParams::forced("test");
        store
            .apply(&config_map("cm", json!({})), &params)
            .await
            .unwrap();

        let mut with_status = config_map("cm", json!({ "ignored": "yes" }));
        with_status.data["status"] = json!({ "state": "Ready" });
        let stored = store
            .apply_status(&with_status, &ApplyParams::owned("test"))
            .await
            .unwrap();
        assert_eq!(stored.data["status"]["state"], "Ready");
        assert!(stored.data["data"].get("ignored").is_none());

        let stored = store.apply(&with_status, &params).await.unwrap();
        assert_eq!(stored.data["status"]["state"], "Ready");
        assert_eq!(stored.data["data"]["ignored"], "yes");
    }
}
