//! A crate for operators that install rendered manifests on behalf of
//! Kubernetes custom resources.
//!
//! Each managed resource is driven through a small state machine
//! (`""` → `Processing` → `Ready`/`Error` → `Deleting`) by a [`Reconciler`].
//! The reconciler renders the resource spec into objects with a
//! [`render::Renderer`], applies them through an [`store::ObjectStore`] and
//! records progress in the resource status. An [`OperatorRuntime`] watches
//! the resource kind and schedules reconciliation per object.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use installer::backoff::MaxOfRateLimiter;
//! use installer::config::Config;
//! use installer::events::KubeRecorder;
//! use installer::render::StaticDirRenderer;
//! use installer::store::{KubeStore, Registry};
//! use installer::{OperatorRuntime, Reconciler, Sample};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let client = kube::Client::try_default().await?;
//!     let registry = Arc::new(Registry::new());
//!     registry.register_kind::<Sample>(true).await;
//!     let store = Arc::new(KubeStore::new(client.clone(), registry));
//!     let recorder = Arc::new(KubeRecorder::new(client.clone(), "template-operator"));
//!     let reconciler = Reconciler::<Sample>::new(
//!         store,
//!         recorder,
//!         Arc::new(StaticDirRenderer::new()),
//!         config.reconciler.clone(),
//!     )?;
//!     let limiter = MaxOfRateLimiter::from_config(&config.rate_limiter);
//!     let mut runtime =
//!         OperatorRuntime::<Sample>::new(client, Arc::new(reconciler), Arc::new(limiter));
//!     runtime
//!         .run_until(async {
//!             tokio::signal::ctrl_c().await.ok();
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod apply;
pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
mod object;
pub mod reconciler;
pub mod render;
pub mod resource;
pub mod runtime;
pub mod status;
pub mod store;
pub mod util;

#[doc(inline)]
pub use error::{AggregateError, Error, Result};
pub use object::{ObjectKey, ObjectRef, TypeRef};
#[doc(inline)]
pub use reconciler::{Reconcile, Reconciler, ReconcilerConfig, Requeue};
#[doc(inline)]
pub use resource::{Installation, Sample, SampleHelm, State};
pub use runtime::OperatorRuntime;
