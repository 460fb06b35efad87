use std::path::{Path, PathBuf};

use tracing::debug;

use super::manifest::parse_manifest_bytes;
use super::{RenderError, RenderedSet, Renderer};
use crate::resource::SampleSpec;

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Loads the single manifest file found in a directory.
///
/// Exactly one `.yaml`/`.yml` file is expected. No such file, or more than
/// one, renders to an empty set rather than an error.
#[derive(Clone, Debug, Default)]
pub struct StaticDirRenderer {
    base_dir: Option<PathBuf>,
}

impl StaticDirRenderer {
    /// Resolve spec paths as given (relative to the working directory).
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative spec paths against `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        }
    }

    /// Render the manifest in `dir`.
    pub async fn render_dir(&self, dir: &Path) -> Result<RenderedSet, RenderError> {
        let io_error = |source| RenderError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let metadata = tokio::fs::metadata(dir).await.map_err(io_error)?;
        if !metadata.is_dir() {
            debug!(path = %dir.display(), "manifest path is not a directory");
            return Ok(RenderedSet::default());
        }

        let mut manifests = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let file_type = entry.file_type().await.map_err(io_error)?;
            if file_type.is_file() && has_manifest_extension(&entry.path()) {
                manifests.push(entry.path());
            }
        }

        let file = match manifests.as_slice() {
            [file] => file,
            [] => {
                debug!(path = %dir.display(), "no yaml file found");
                return Ok(RenderedSet::default());
            }
            _ => {
                debug!(
                    path = %dir.display(),
                    count = manifests.len(),
                    "more than one yaml file found"
                );
                return Ok(RenderedSet::default());
            }
        };

        let bytes = tokio::fs::read(file).await.map_err(|source| RenderError::Io {
            path: file.clone(),
            source,
        })?;
        parse_manifest_bytes(&bytes)
    }
}

fn has_manifest_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MANIFEST_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl Renderer<SampleSpec> for StaticDirRenderer {
    async fn render(&self, spec: &SampleSpec) -> Result<RenderedSet, RenderError> {
        self.render_dir(&self.resolve(&spec.resource_file_path)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG_MAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: default\n";

    #[tokio::test]
    async fn renders_single_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.yaml"), CONFIG_MAP).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();
        let rendered = StaticDirRenderer::new().render_dir(dir.path()).await.unwrap();
        assert_eq!(rendered.objects.len(), 1);
    }

    #[tokio::test]
    async fn empty_directory_renders_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let rendered = StaticDirRenderer::new().render_dir(dir.path()).await.unwrap();
        assert!(rendered.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_directory_renders_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.yaml"), CONFIG_MAP).unwrap();
        std::fs::write(dir.path().join("two.yml"), CONFIG_MAP).unwrap();
        let rendered = StaticDirRenderer::new().render_dir(dir.path()).await.unwrap();
        assert!(rendered.is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("invalid/path");
        let err = StaticDirRenderer::new().render_dir(&missing).await.unwrap_err();
        assert!(matches!(err, RenderError::Io { .. }));
    }

    #[tokio::test]
    async fn spec_path_is_resolved_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("manifest")).unwrap();
        std::fs::write(dir.path().join("manifest/cm.yml"), CONFIG_MAP).unwrap();
        let renderer = StaticDirRenderer::with_base_dir(dir.path());
        let rendered = renderer
            .render(&SampleSpec {
                resource_file_path: "manifest".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rendered.objects.len(), 1);
    }
}
