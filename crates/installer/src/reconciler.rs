//! The reconciliation state machine.
//!
//! A single pass fetches the installation, performs at most one transition
//! and returns a [`Requeue`] directive telling the scheduler when to run the
//! next pass. Nothing is retried inside a pass.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::apply::ApplyPipeline;
use crate::error::{Error, Result};
use crate::events::{
    object_reference, EventType, Recorder, REASON_RESOURCES_DELETE, REASON_RESOURCES_INSTALL,
};
use crate::object::{ObjectKey, TypeRef};
use crate::render::{RenderedSet, Renderer};
use crate::resource::{ConditionStatus, Installation, State};
use crate::status::StatusManager;
use crate::store::ObjectStore;
use crate::util::concrete_object;

/// Default finalizer guarding installed resources.
pub const DEFAULT_FINALIZER: &str = "operator.template.dev/finalizer";
/// Default field manager identity.
pub const DEFAULT_FIELD_OWNER: &str = "operator.template.dev/owner";
/// Default steady-state poll interval.
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(3);

/// When the scheduler should run the next pass for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Only when the object changes again.
    Never,
    /// Right away.
    Immediately,
    /// After a fixed delay, independent of failure history.
    After(Duration),
    /// After the delay chosen by the rate limiter.
    Backoff,
}

/// One reconciliation pass for a key.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    /// Reconcile the object stored under `key`.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue>;
}

/// Settings of a [`Reconciler`].
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// State written after a successful installation.
    pub final_state: State,
    /// Finalizer added before anything is installed.
    pub finalizer: String,
    /// Field manager for every write.
    pub field_owner: String,
    /// Delay between steady-state passes.
    pub requeue_interval: Duration,
    /// Maximum number of objects applied or deleted at once.
    pub apply_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            final_state: State::Ready,
            finalizer: DEFAULT_FINALIZER.to_string(),
            field_owner: DEFAULT_FIELD_OWNER.to_string(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            apply_concurrency: 1,
        }
    }
}

impl ReconcilerConfig {
    /// Reject settings the state machine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.final_state, State::Initial | State::Deleting) {
            return Err(Error::Config(format!(
                "final state {:?} is not a terminal state",
                self.final_state.as_str()
            )));
        }
        if self.finalizer.is_empty() {
            return Err(Error::Config("finalizer must not be empty".to_string()));
        }
        if self.field_owner.is_empty() {
            return Err(Error::Config("field owner must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Drives installations of kind `K` through their lifecycle.
pub struct Reconciler<K: Installation> {
    store: Arc<dyn ObjectStore>,
    renderer: Arc<dyn Renderer<K::Spec>>,
    recorder: Arc<dyn Recorder>,
    pipeline: ApplyPipeline,
    status: StatusManager,
    config: ReconcilerConfig,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Installation> Reconciler<K> {
    /// Create a reconciler. Fails if `config` is invalid.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        recorder: Arc<dyn Recorder>,
        renderer: Arc<dyn Renderer<K::Spec>>,
        config: ReconcilerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = ApplyPipeline::new(store.clone(), config.field_owner.clone())
            .with_concurrency(config.apply_concurrency);
        let status = StatusManager::new(store.clone(), recorder.clone(), config.field_owner.clone());
        Ok(Reconciler {
            store,
            renderer,
            recorder,
            pipeline,
            status,
            config,
            _kind: PhantomData,
        })
    }

    /// The active settings.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<K>> {
        match self.store.get(&TypeRef::of::<K>(), key).await {
            Ok(object) => Ok(Some(concrete_object(object)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn render(&self, resource: &K) -> Result<RenderedSet> {
        Ok(self.renderer.render(resource.spec()).await?)
    }

    async fn install(&self, resource: &K) -> Result<()> {
        let rendered = self.render(resource).await?;
        self.pipeline.apply(&rendered).await
    }

    /// Record an installation failure. The resource moves to `Error`.
    async fn fail(&self, resource: &K, reason: &str, message: &str, error: Error) -> Result<Requeue> {
        warn!(error = %error, "{}", message);
        self.recorder
            .publish(
                &object_reference(resource),
                EventType::Warning,
                reason,
                message,
            )
            .await;
        self.status
            .set_status(resource, State::Error, ConditionStatus::False)
            .await?;
        Ok(Requeue::Backoff)
    }

    async fn handle_initial(&self, resource: &K) -> Result<Requeue> {
        self.status
            .set_status(resource, State::Processing, ConditionStatus::Unknown)
            .await?;
        Ok(Requeue::Immediately)
    }

    async fn handle_processing(&self, resource: &K) -> Result<Requeue> {
        match self.install(resource).await {
            Ok(()) => {
                self.status
                    .set_status(resource, self.config.final_state, ConditionStatus::True)
                    .await?;
                Ok(Requeue::After(self.config.requeue_interval))
            }
            Err(e) => {
                self.fail(resource, REASON_RESOURCES_INSTALL, "installing resources error", e)
                    .await
            }
        }
    }

    async fn handle_final(&self, resource: &K) -> Result<Requeue> {
        match self.install(resource).await {
            Ok(()) => {
                debug!("resources are up to date");
                Ok(Requeue::After(self.config.requeue_interval))
            }
            Err(e) => {
                self.fail(resource, REASON_RESOURCES_INSTALL, "installing resources error", e)
                    .await
            }
        }
    }

    async fn handle_deleting(&self, resource: &K) -> Result<Requeue> {
        let rendered = match self.render(resource).await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, "could not render resources, deleting nothing");
                RenderedSet::default()
            }
        };
        if let Err(e) = self.pipeline.delete(&rendered).await {
            return self
                .fail(resource, REASON_RESOURCES_DELETE, "deleting resources error", e)
                .await;
        }

        let finalizers: Vec<String> = resource
            .meta()
            .finalizers
            .iter()
            .flatten()
            .filter(|f| **f != self.config.finalizer)
            .cloned()
            .collect();
        self.status.set_finalizers(resource, finalizers).await?;
        info!("resources deleted, finalizer removed");
        Ok(Requeue::Never)
    }

    async fn mark_deleting(&self, resource: &K) -> Result<Requeue> {
        let condition = resource
            .installation_status()
            .and_then(|s| s.installation_condition())
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown);
        self.status
            .set_status(resource, State::Deleting, condition)
            .await?;
        Ok(Requeue::Immediately)
    }

    async fn add_finalizer(&self, resource: &K) -> Result<Requeue> {
        let mut finalizers = resource.meta().finalizers.clone().unwrap_or_default();
        finalizers.push(self.config.finalizer.clone());
        self.status.set_finalizers(resource, finalizers).await?;
        debug!("finalizer added");
        Ok(Requeue::Immediately)
    }
}

#[async_trait::async_trait]
impl<K: Installation> Reconcile for Reconciler<K> {
    #[instrument(
        level = "info",
        skip(self, key),
        fields(kind = %K::kind(&()), name = key.name(), namespace = ?key.namespace())
    )]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue> {
        let resource = match self.fetch(key).await? {
            Some(resource) => resource,
            None => {
                info!("resource got deleted");
                return Ok(Requeue::Never);
            }
        };
        let state = resource
            .installation_status()
            .map(|s| s.state)
            .unwrap_or_default();
        let has_finalizer = resource.has_finalizer(&self.config.finalizer);

        if resource.deletion_requested() {
            if !has_finalizer {
                debug!("deletion requested and nothing was installed");
                return Ok(Requeue::Never);
            }
            if state != State::Deleting {
                return self.mark_deleting(&resource).await;
            }
        }

        if !has_finalizer {
            return self.add_finalizer(&resource).await;
        }

        debug!(%state, "handling state");
        match state {
            State::Initial => self.handle_initial(&resource).await,
            State::Processing | State::Error => self.handle_processing(&resource).await,
            State::Deleting => self.handle_deleting(&resource).await,
            State::Ready | State::Warning if state == self.config.final_state => {
                self.handle_final(&resource).await
            }
            State::Ready | State::Warning => self.handle_processing(&resource).await,
        }
    }
}
