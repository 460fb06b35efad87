//! Turning an installation's spec into the objects that should exist.
//!
//! Two strategies share one output contract, [`RenderedSet`]:
//! [`StaticDirRenderer`] loads a single manifest file from a directory and
//! [`ChartRenderer`] renders a templated package.

use std::path::PathBuf;

use kube::api::DynamicObject;

mod chart;
mod manifest;
mod static_dir;

pub use chart::{
    ChartMode, ChartRenderer, ReleaseOptions, DEFAULT_RELEASE_NAME, DEFAULT_RELEASE_NAMESPACE,
};
pub use manifest::parse_manifest;
pub use static_dir::StaticDirRenderer;

/// Errors that stop rendering. A missing or ambiguous manifest source is not
/// one of them; it renders to an empty set.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The source could not be read.
    #[error("could not read {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The manifest stream itself is malformed.
    #[error("invalid YAML document: {0}")]
    Manifest(String),
    /// The package metadata is missing or invalid.
    #[error("invalid chart at {path}: {message}")]
    Chart {
        /// Chart directory.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },
    /// A template failed to render.
    #[error("template {name} failed to render: {source}")]
    Template {
        /// Template file name.
        name: String,
        /// Engine error.
        #[source]
        source: minijinja::Error,
    },
    /// Resolving the rendered objects against the store failed.
    #[error("server-side dry run failed: {0}")]
    DryRun(String),
}

/// Output of a renderer.
#[derive(Clone, Debug, Default)]
pub struct RenderedSet {
    /// Structured objects, in manifest order.
    pub objects: Vec<DynamicObject>,
    /// Documents that could not be parsed as objects. Kept verbatim and never
    /// applied.
    pub raw_blobs: Vec<Vec<u8>>,
}

impl RenderedSet {
    /// Whether the set has neither objects nor blobs.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.raw_blobs.is_empty()
    }
}

/// Produces the objects for an installation spec.
#[async_trait::async_trait]
pub trait Renderer<S>: Send + Sync
where
    S: Send + Sync,
{
    /// Render `spec` into an ordered set of objects.
    async fn render(&self, spec: &S) -> Result<RenderedSet, RenderError>;
}
