//! Error taxonomy shared by the store adapters, the apply pipeline and the
//! reconciler.

use std::fmt;
use std::time::Duration;

use crate::render::RenderError;
use crate::resource::State;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while reconciling an installation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object does not exist in the store.
    #[error("{0} not found")]
    NotFound(String),
    /// A create raced with another writer and the object already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// The object's resource version no longer matches the one we read.
    #[error("conflict on {0}: the object has been modified")]
    Conflict(String),
    /// A store call did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Rendering the dependent resources failed.
    #[error("rendering resources failed: {0}")]
    Render(#[from] RenderError),
    /// One or more objects could not be applied or deleted.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    /// Writing status or finalizers back to the custom resource failed.
    #[error("failed to persist state {state}: {source}")]
    Persistence {
        /// The state we attempted to persist.
        state: State,
        /// The underlying store error.
        #[source]
        source: Box<Error>,
    },
    /// The object could not be interpreted (missing name, apiVersion or kind).
    #[error("invalid object: {0}")]
    InvalidObject(String),
    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The store rejected the request for a reason outside the other classes.
    #[error("store rejected request: {0}")]
    Store(String),
    /// An error returned by the Kubernetes API client.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// Converting between typed and dynamic objects failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is expected to clear up on its own, so the caller
    /// should simply try again later.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::Timeout(_) | Error::Store(_) => true,
            Error::Persistence { source, .. } => source.is_transient(),
            Error::Aggregate(aggregate) => aggregate.errors().iter().all(Error::is_transient),
            _ => false,
        }
    }

    /// Returns `true` for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns `true` for [`Error::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Returns `true` for [`Error::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// The join of every per-object failure from one apply or delete pass.
///
/// Each message is preserved and the messages are separated by newlines.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure.
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// The individual failures, in the order they were recorded.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Whether any failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise the aggregate itself.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        f.write_str(&joined)
    }
}

impl std::error::Error for AggregateError {}

impl From<Vec<Error>> for AggregateError {
    fn from(errors: Vec<Error>) -> Self {
        Self { errors }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aggregate_joins_messages_with_newlines() {
        let mut aggregate = AggregateError::new();
        aggregate.push(Error::Store("first".to_string()));
        aggregate.push(Error::NotFound("v1/Pod default/busybox".to_string()));
        assert_eq!(
            aggregate.to_string(),
            "store rejected request: first\nv1/Pod default/busybox not found"
        );
    }

    #[test]
    fn empty_aggregate_is_ok() {
        assert!(AggregateError::new().into_result().is_ok());
    }

    #[test]
    fn conflict_and_timeout_are_transient() {
        assert!(Error::Conflict("x".to_string()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!Error::InvalidObject("x".to_string()).is_transient());
        let persistence = Error::Persistence {
            state: State::Ready,
            source: Box::new(Error::Conflict("x".to_string())),
        };
        assert!(persistence.is_transient());
    }
}
