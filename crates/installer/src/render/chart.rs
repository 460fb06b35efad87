use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use minijinja::{Environment, UndefinedBehavior};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use super::manifest::parse_manifest;
use super::{RenderError, RenderedSet, Renderer};
use crate::resource::SampleHelmSpec;
use crate::store::{ApplyParams, ObjectStore};

const CHART_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";
const TEMPLATES_DIR: &str = "templates";
const CRDS_DIR: &str = "crds";

/// Release name used when none is configured.
pub const DEFAULT_RELEASE_NAME: &str = "sample-release-name";
/// Release namespace used when none is configured.
pub const DEFAULT_RELEASE_NAMESPACE: &str = "default";

/// How rendered chart objects are resolved.
#[derive(Clone)]
pub enum ChartMode {
    /// Return the rendered manifest as is. Nothing is sent to the store.
    ClientOnly,
    /// Apply every rendered object to the store in dry-run mode and return
    /// the objects as the store resolved them.
    ServerDryRun {
        /// Store that resolves the objects.
        store: Arc<dyn ObjectStore>,
        /// Field manager used for the dry run.
        field_manager: String,
    },
}

impl fmt::Debug for ChartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChartMode::ClientOnly => f.write_str("ClientOnly"),
            ChartMode::ServerDryRun { field_manager, .. } => f
                .debug_struct("ServerDryRun")
                .field("field_manager", field_manager)
                .finish(),
        }
    }
}

/// Release settings exposed to templates.
#[derive(Clone, Debug)]
pub struct ReleaseOptions {
    /// `release.name` in templates.
    pub name: String,
    /// `release.namespace` in templates.
    pub namespace: String,
    /// Merged over the chart's `values.yaml`.
    pub values: Value,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        ReleaseOptions {
            name: DEFAULT_RELEASE_NAME.to_string(),
            namespace: DEFAULT_RELEASE_NAMESPACE.to_string(),
            values: json!({ "label": "custom-label-from-controller" }),
        }
    }
}

#[derive(Deserialize)]
struct ChartMetadata {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
}

/// Renders a chart directory.
///
/// A chart holds a `Chart.yaml` with `name` and `version`, an optional
/// `values.yaml`, optional plain manifests under `crds/`, and templates under
/// `templates/`. Templates use Jinja syntax and see `values`, `release` and
/// `chart`. Files whose name starts with `_` are partials: other templates
/// can `include` or `import` them, but they are not rendered on their own.
#[derive(Clone, Debug)]
pub struct ChartRenderer {
    mode: ChartMode,
    release: ReleaseOptions,
    base_dir: Option<PathBuf>,
}

impl ChartRenderer {
    /// Create a renderer.
    pub fn new(mode: ChartMode, release: ReleaseOptions) -> Self {
        ChartRenderer {
            mode,
            release,
            base_dir: None,
        }
    }

    /// Resolve relative chart paths against `base_dir`.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Render the chart in `dir`.
    pub async fn render_chart(&self, dir: &Path) -> Result<RenderedSet, RenderError> {
        let metadata = load_metadata(dir).await?;
        let mut values = load_values(dir).await?;
        json_patch::merge(&mut values, &self.release.values);
        let context = json!({
            "values": values,
            "release": {
                "name": self.release.name,
                "namespace": self.release.namespace,
            },
            "chart": {
                "name": metadata.name,
                "version": metadata.version,
                "description": metadata.description,
            },
        });

        let mut documents = Vec::new();
        for file in manifest_files(&dir.join(CRDS_DIR)).await? {
            if !is_partial(&file_name(&file)) {
                documents.push(read_to_string(&file).await?);
            }
        }

        let mut templates = Vec::new();
        for file in manifest_files(&dir.join(TEMPLATES_DIR)).await? {
            templates.push((file_name(&file), read_to_string(&file).await?));
        }
        documents.extend(render_templates(&templates, &context)?);

        let rendered = parse_manifest(&documents.join("\n---\n"))?;
        debug!(
            chart = %metadata.name,
            objects = rendered.objects.len(),
            "chart rendered"
        );

        match &self.mode {
            ChartMode::ClientOnly => Ok(rendered),
            ChartMode::ServerDryRun {
                store,
                field_manager,
            } => resolve(store.as_ref(), field_manager, rendered).await,
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        }
    }
}

#[async_trait::async_trait]
impl Renderer<SampleHelmSpec> for ChartRenderer {
    async fn render(&self, spec: &SampleHelmSpec) -> Result<RenderedSet, RenderError> {
        self.render_chart(&self.resolve_path(&spec.chart_path)).await
    }
}

async fn resolve(
    store: &dyn ObjectStore,
    field_manager: &str,
    rendered: RenderedSet,
) -> Result<RenderedSet, RenderError> {
    let params = ApplyParams::forced(field_manager).dry_run();
    let mut objects = Vec::with_capacity(rendered.objects.len());
    for object in &rendered.objects {
        let resolved = store
            .apply(object, &params)
            .await
            .map_err(|e| RenderError::DryRun(e.to_string()))?;
        objects.push(resolved);
    }
    Ok(RenderedSet {
        objects,
        raw_blobs: rendered.raw_blobs,
    })
}

async fn load_metadata(dir: &Path) -> Result<ChartMetadata, RenderError> {
    let path = dir.join(CHART_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(RenderError::Chart {
                path: dir.to_path_buf(),
                message: format!("{} not found", CHART_FILE),
            })
        }
        Err(source) => return Err(RenderError::Io { path, source }),
    };
    let metadata: ChartMetadata =
        serde_yaml::from_str(&content).map_err(|e| RenderError::Chart {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
    if metadata.name.is_empty() || metadata.version.is_empty() {
        return Err(RenderError::Chart {
            path: dir.to_path_buf(),
            message: "chart name and version must not be empty".to_string(),
        });
    }
    Ok(metadata)
}

async fn load_values(dir: &Path) -> Result<Value, RenderError> {
    let path = dir.join(VALUES_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(json!({})),
        Err(source) => return Err(RenderError::Io { path, source }),
    };
    let values: Value = serde_yaml::from_str(&content).map_err(|e| RenderError::Chart {
        path: dir.to_path_buf(),
        message: format!("invalid {}: {}", VALUES_FILE, e),
    })?;
    match values {
        Value::Null => Ok(json!({})),
        Value::Object(_) => Ok(values),
        _ => Err(RenderError::Chart {
            path: dir.to_path_buf(),
            message: format!("{} must be a mapping", VALUES_FILE),
        }),
    }
}

/// Render every template that is not a partial, in name order.
///
/// All templates are registered first, so partials (names starting with `_`)
/// can be pulled in with `include` or `import`. They are never rendered on
/// their own.
fn render_templates(templates: &[(String, String)], context: &Value) -> Result<Vec<String>, RenderError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    for (name, source) in templates {
        env.add_template(name.as_str(), source.as_str())
            .map_err(|source| RenderError::Template {
                name: name.clone(),
                source,
            })?;
    }
    let mut rendered = Vec::new();
    for (name, _) in templates.iter().filter(|(name, _)| !is_partial(name)) {
        trace!(template = %name, "rendering template");
        let output = env
            .get_template(name)
            .and_then(|template| template.render(context))
            .map_err(|source| RenderError::Template {
                name: name.clone(),
                source,
            })?;
        rendered.push(output);
    }
    Ok(rendered)
}

fn is_partial(name: &str) -> bool {
    name.starts_with('_')
}

/// `.yaml`/`.yml` files directly in `dir`, sorted by name. A missing
/// directory has no files.
async fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>, RenderError> {
    let io_error = |source| RenderError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(e)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        let is_manifest = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !entry.file_type().await.map_err(io_error)?.is_file() || !is_manifest {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

async fn read_to_string(path: &Path) -> Result<String, RenderError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RenderError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemoryStore;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn sample_chart() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Chart.yaml", "apiVersion: v2\nname: redis\nversion: 0.1.0\n");
        write(dir.path(), "values.yaml", "label: from-chart\nreplicas: 2\n");
        write(
            dir.path(),
            "templates/configmap.yaml",
            r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ release.name }}-config
  namespace: {{ release.namespace }}
  labels:
    sample: {{ values.label }}
data:
  replicas: "{{ values.replicas }}"
  chart: {{ chart.name }}-{{ chart.version }}
"#,
        );
        write(
            dir.path(),
            "templates/_fullname.yaml",
            "{{ release.name }}-{{ chart.name }}\n",
        );
        write(dir.path(), "templates/NOTES.txt", "not a manifest");
        dir
    }

    #[tokio::test]
    async fn renders_with_value_overlay() {
        let chart = sample_chart();
        let renderer = ChartRenderer::new(ChartMode::ClientOnly, ReleaseOptions::default());
        let rendered = renderer.render_chart(chart.path()).await.unwrap();
        assert_eq!(rendered.objects.len(), 1);
        let config_map = &rendered.objects[0];
        assert_eq!(
            config_map.metadata.name.as_deref(),
            Some("sample-release-name-config")
        );
        assert_eq!(
            config_map.metadata.labels.as_ref().unwrap()["sample"],
            "custom-label-from-controller"
        );
        assert_eq!(config_map.data["data"]["replicas"], "2");
        assert_eq!(config_map.data["data"]["chart"], "redis-0.1.0");
    }

    #[tokio::test]
    async fn partials_are_included_but_not_rendered() {
        let chart = sample_chart();
        write(
            chart.path(),
            "templates/service.yaml",
            r#"apiVersion: v1
kind: Service
metadata:
  name: {% include "_fullname.yaml" %}
  namespace: {{ release.namespace }}
"#,
        );
        let renderer = ChartRenderer::new(ChartMode::ClientOnly, ReleaseOptions::default());
        let rendered = renderer.render_chart(chart.path()).await.unwrap();
        assert_eq!(rendered.objects.len(), 2);
        assert!(rendered.raw_blobs.is_empty());
        let service = &rendered.objects[1];
        assert_eq!(service.types.as_ref().unwrap().kind, "Service");
        assert_eq!(
            service.metadata.name.as_deref(),
            Some("sample-release-name-redis")
        );
    }

    #[tokio::test]
    async fn broken_partial_is_an_error() {
        let chart = sample_chart();
        write(chart.path(), "templates/_broken.yaml", "{{ release.name ");
        let renderer = ChartRenderer::new(ChartMode::ClientOnly, ReleaseOptions::default());
        let err = renderer.render_chart(chart.path()).await.unwrap_err();
        assert!(matches!(err, RenderError::Template { ref name, .. } if name == "_broken.yaml"));
    }

    #[tokio::test]
    async fn crds_are_included_verbatim_first() {
        let chart = sample_chart();
        write(
            chart.path(),
            "crds/crd.yaml",
            "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: things.example.com\n",
        );
        let renderer = ChartRenderer::new(ChartMode::ClientOnly, ReleaseOptions::default());
        let rendered = renderer.render_chart(chart.path()).await.unwrap();
        assert_eq!(rendered.objects.len(), 2);
        assert_eq!(
            rendered.objects[0].types.as_ref().unwrap().kind,
            "CustomResourceDefinition"
        );
    }

    #[tokio::test]
    async fn missing_chart_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ChartRenderer::new(ChartMode::ClientOnly, ReleaseOptions::default());
        let err = renderer.render_chart(dir.path()).await.unwrap_err();
        assert!(matches!(err, RenderError::Chart { .. }));
    }

    #[tokio::test]
    async fn template_syntax_error_is_an_error() {
        let chart = sample_chart();
        write(chart.path(), "templates/broken.yaml", "name: {{ values.label ");
        let renderer = ChartRenderer::new(ChartMode::ClientOnly, ReleaseOptions::default());
        let err = renderer.render_chart(chart.path()).await.unwrap_err();
        assert!(matches!(err, RenderError::Template { ref name, .. } if name == "broken.yaml"));
    }

    #[tokio::test]
    async fn server_dry_run_resolves_without_persisting() {
        let chart = sample_chart();
        let store = Arc::new(MemoryStore::new());
        let renderer = ChartRenderer::new(
            ChartMode::ServerDryRun {
                store: store.clone(),
                field_manager: "installer".to_string(),
            },
            ReleaseOptions::default(),
        );
        let rendered = renderer.render_chart(chart.path()).await.unwrap();
        assert_eq!(rendered.objects.len(), 1);
        assert!(rendered.objects[0].metadata.uid.is_some());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn spec_path_is_resolved_against_base_dir() {
        let chart = sample_chart();
        let renderer = ChartRenderer::new(ChartMode::ClientOnly, ReleaseOptions::default())
            .with_base_dir(chart.path().parent().unwrap());
        let spec = SampleHelmSpec {
            chart_path: file_name(chart.path()),
        };
        assert_eq!(renderer.render(&spec).await.unwrap().objects.len(), 1);
    }
}
