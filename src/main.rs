use std::sync::Arc;

use futures::FutureExt;
use installer::backoff::MaxOfRateLimiter;
use installer::config::Config;
use installer::events::KubeRecorder;
use installer::render::{ChartMode, ChartRenderer, StaticDirRenderer};
use installer::store::{KubeStore, ObjectStore, Registry};
use installer::{OperatorRuntime, Reconciler, Sample, SampleHelm};
use tracing::info;
use tracing_subscriber::EnvFilter;

const COMPONENT: &str = "template-operator";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));
    config.reconciler.validate()?;

    // Tries a KubeConfig file first, then falls back on an in-cluster configuration.
    let client = kube::Client::try_default().await?;

    let registry = Arc::new(Registry::new());
    registry.register_kind::<Sample>(true).await;
    registry.register_kind::<SampleHelm>(true).await;
    let store: Arc<dyn ObjectStore> = Arc::new(
        KubeStore::new(client.clone(), registry).with_timeout(config.request_timeout),
    );
    let recorder = Arc::new(KubeRecorder::new(client.clone(), COMPONENT));

    let chart_mode = if config.chart_server_dry_run {
        ChartMode::ServerDryRun {
            store: store.clone(),
            field_manager: config.reconciler.field_owner.clone(),
        }
    } else {
        ChartMode::ClientOnly
    };

    let samples = Reconciler::<Sample>::new(
        store.clone(),
        recorder.clone(),
        Arc::new(StaticDirRenderer::new()),
        config.reconciler.clone(),
    )?;
    let sample_helms = Reconciler::<SampleHelm>::new(
        store,
        recorder,
        Arc::new(ChartRenderer::new(chart_mode, config.release.clone())),
        config.reconciler.clone(),
    )?;

    // Each kind gets its own limiter so one kind cannot starve the other.
    let mut sample_runtime = OperatorRuntime::<Sample>::new(
        client.clone(),
        Arc::new(samples),
        Arc::new(MaxOfRateLimiter::from_config(&config.rate_limiter)),
    )
    .with_namespace(config.namespace.clone());
    let mut sample_helm_runtime = OperatorRuntime::<SampleHelm>::new(
        client,
        Arc::new(sample_helms),
        Arc::new(MaxOfRateLimiter::from_config(&config.rate_limiter)),
    )
    .with_namespace(config.namespace.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "unable to listen for shutdown signal");
        }
    }
    .shared();

    info!(version = env!("CARGO_PKG_VERSION"), "starting {}", COMPONENT);
    futures::join!(
        sample_runtime.run_until(shutdown.clone()),
        sample_helm_runtime.run_until(shutdown),
    );
    info!("shut down");
    Ok(())
}
