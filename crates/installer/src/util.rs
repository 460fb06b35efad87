//! Conversions between typed resources and `kube::api::DynamicObject`.

use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Convert `kube::api::DynamicObject` to a concrete type which must implement
/// `DeserializeOwned`.
///
/// For now this simply serializes the `DynamicObject` to JSON and then
/// deserializes to the desired type.
///
/// # Errors
///
/// If serialization or deserialization fail.
pub fn concrete_object<R>(dynamic_object: DynamicObject) -> Result<R>
where
    R: DeserializeOwned,
{
    let value = serde_json::to_value(&dynamic_object)?;
    Ok(serde_json::from_value::<R>(value)?)
}

/// Type-erase any serializable resource into a `DynamicObject`.
pub fn dynamic_object<R>(object: &R) -> Result<DynamicObject>
where
    R: Serialize,
{
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value::<DynamicObject>(value)?)
}
