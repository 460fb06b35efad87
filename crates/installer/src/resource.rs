//! Custom resources reconciled by the installer and their status types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::object::ObjectKey;

/// API group of the installer's custom resources.
pub const GROUP: &str = "operator.template.dev";
/// The only condition type managed by the installer.
pub const CONDITION_TYPE_INSTALLATION: &str = "Installation";

/// Installs the manifest found in a local directory.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "operator.template.dev",
    version = "v1alpha1",
    kind = "Sample",
    status = "InstallationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SampleSpec {
    /// Directory holding exactly one `.yaml`/`.yml` manifest file.
    #[serde(default)]
    pub resource_file_path: String,
}

/// Installs the output of a templated package ("chart").
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "operator.template.dev",
    version = "v1alpha1",
    kind = "SampleHelm",
    status = "InstallationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SampleHelmSpec {
    /// Directory of the chart (containing `Chart.yaml`).
    #[serde(default)]
    pub chart_path: String,
}

/// Lifecycle state of an installation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum State {
    /// Never reconciled.
    #[serde(rename = "")]
    Initial,
    /// Resources are being installed.
    Processing,
    /// Resources are installed.
    Ready,
    /// Resources are installed, flagged for attention.
    Warning,
    /// Installing or deleting resources failed; will be retried.
    Error,
    /// Deletion was requested and resources are being removed.
    Deleting,
}

impl Default for State {
    fn default() -> Self {
        State::Initial
    }
}

impl State {
    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Initial => "",
            State::Processing => "Processing",
            State::Ready => "Ready",
            State::Warning => "Warning",
            State::Error => "Error",
            State::Deleting => "Deleting",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the known states.
#[derive(Debug, thiserror::Error)]
#[error("unknown state {0:?}")]
pub struct UnknownState(String);

impl FromStr for State {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(State::Initial),
            "Processing" => Ok(State::Processing),
            "Ready" => Ok(State::Ready),
            "Warning" => Ok(State::Warning),
            "Error" => Ok(State::Error),
            "Deleting" => Ok(State::Deleting),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Status of a condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Not known yet.
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A single typed status fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Unique key of the condition within a status.
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds.
    pub status: ConditionStatus,
    /// Machine readable reason for the last transition.
    #[serde(default)]
    pub reason: String,
    /// Human readable details.
    #[serde(default)]
    pub message: String,
    /// `metadata.generation` the condition was computed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// When `status` last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Observed state shared by every installation kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    /// Lifecycle state.
    #[serde(default)]
    pub state: State,
    /// Conditions, at most one per type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl InstallationStatus {
    /// Replace the state.
    pub fn with_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    /// Upsert the installation condition for the given generation.
    pub fn with_installation_condition(
        mut self,
        status: ConditionStatus,
        generation: Option<i64>,
    ) -> Self {
        let (reason, message) = match status {
            ConditionStatus::True => ("Ready", "installation is ready and resources can be used"),
            ConditionStatus::False => ("Error", "installation failed, resources will be retried"),
            ConditionStatus::Unknown => ("Processing", "installation is in progress"),
        };
        self.set_condition(Condition {
            type_: CONDITION_TYPE_INSTALLATION.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: generation,
            last_transition_time: Some(Utc::now()),
        });
        self
    }

    /// Find a condition by type.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// The installation condition, if set.
    pub fn installation_condition(&self) -> Option<&Condition> {
        self.condition(CONDITION_TYPE_INSTALLATION)
    }

    /// Insert or update a condition keyed by its type. The transition time is
    /// only moved when the status actually changes.
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status != condition.status {
                    existing.status = condition.status;
                    existing.last_transition_time = condition.last_transition_time;
                }
                existing.reason = condition.reason;
                existing.message = condition.message;
                existing.observed_generation = condition.observed_generation;
            }
            None => self.conditions.push(condition),
        }
    }
}

/// A custom resource whose spec renders into installable objects.
pub trait Installation:
    Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Renderer input.
    type Spec: Send + Sync;

    /// The desired state.
    fn spec(&self) -> &Self::Spec;

    /// The observed state, if any was written yet.
    fn installation_status(&self) -> Option<&InstallationStatus>;

    /// Namespace and name of the resource.
    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(
            meta.namespace.clone(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// Whether the store has been asked to delete the resource.
    fn deletion_requested(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Whether `finalizer` is present.
    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.meta()
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|f| f == finalizer))
            .unwrap_or(false)
    }
}

impl Installation for Sample {
    type Spec = SampleSpec;

    fn spec(&self) -> &SampleSpec {
        &self.spec
    }

    fn installation_status(&self) -> Option<&InstallationStatus> {
        self.status.as_ref()
    }
}

impl Installation for SampleHelm {
    type Spec = SampleHelmSpec;

    fn spec(&self) -> &SampleHelmSpec {
        &self.spec
    }

    fn installation_status(&self) -> Option<&InstallationStatus> {
        self.status.as_ref()
    }
}
