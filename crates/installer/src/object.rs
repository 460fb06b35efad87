//! Identity of objects held in the store.

use std::fmt;

use kube::api::DynamicObject;
use kube::Resource;

use crate::error::{Error, Result};

/// Namespace and name of an object. This is the unit of work handed to the
/// reconciler.
#[derive(Hash, Eq, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Create a key for a namespaced (or, with `None`, cluster scoped) object.
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        ObjectKey {
            namespace,
            name: name.into(),
        }
    }

    /// Shorthand for a namespaced key.
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace.to_string()), name)
    }

    /// Name of the object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the object, if it is namespaced.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Key of any typed or dynamic object. Fails when `metadata.name` is unset.
    pub fn of<R: Resource>(object: &R) -> Result<Self> {
        let meta = object.meta();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::InvalidObject("metadata.name is not set".to_string()))?;
        Ok(ObjectKey::new(meta.namespace.clone(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The `apiVersion` and `kind` of an object.
#[derive(Hash, Eq, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct TypeRef {
    /// `group/version`, or just `version` for the core group.
    pub api_version: String,
    /// The object kind.
    pub kind: String,
}

impl TypeRef {
    /// Create a type reference.
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        TypeRef {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Type of a statically typed resource.
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        TypeRef::new(K::api_version(&()), K::kind(&()))
    }

    /// Split `api_version` into its group (empty for core) and version.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Full identity of an object: its type plus its key.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub struct ObjectRef {
    /// Type of the object.
    pub type_ref: TypeRef,
    /// Namespace and name of the object.
    pub key: ObjectKey,
}

impl ObjectRef {
    /// Identity of a dynamic object. Fails if `apiVersion`, `kind` or
    /// `metadata.name` are missing; the object is never inspected further.
    pub fn of_dynamic(object: &DynamicObject) -> Result<Self> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| Error::InvalidObject("apiVersion and kind are not set".to_string()))?;
        Ok(ObjectRef {
            type_ref: TypeRef::new(types.api_version.clone(), types.kind.clone()),
            key: ObjectKey::of(object)?,
        })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_ref, self.key)
    }
}
