//! Process entry point: loads configuration, wires the record store,
//! scheduler adapter and webhook notifier into a coordinator, and serves
//! the JSON-RPC surface over HTTP until a termination signal arrives.

use buildpilot_config::Config;
use buildpilot_engine::Coordinator;
use buildpilot_scheduler::nomad::NomadScheduler;
use buildpilot_scheduler::SchedulerAdapter;
use buildpilot_store::consul::ConsulStore;
use buildpilot_store::RecordStore;
use buildpilot_webhook::WebhookNotifier;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Grace period given to in-flight pipelines to tear down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = Arc::new(Config::parse());

    let mut store = ConsulStore::new(&config.kv_address, &config.kv_key_prefix);
    if let Some(token) = &config.kv_token {
        store = store.with_token(token.clone());
    }
    if let Some(dc) = &config.kv_datacenter {
        store = store.with_datacenter(dc.clone());
    }
    let store: Arc<dyn RecordStore> = Arc::new(store);

    let mut scheduler = NomadScheduler::new(&config.scheduler_address, &config.scheduler_datacenter);
    if let Some(region) = &config.scheduler_region {
        scheduler = scheduler.with_region(region.clone());
    }
    let scheduler: Arc<dyn SchedulerAdapter> = Arc::new(scheduler);

    let webhook = Arc::new(WebhookNotifier::new());

    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        scheduler.clone(),
        webhook,
        config.clone(),
    ));
    coordinator.spawn_background_tasks();

    let state = buildpilot_api::AppState::new(coordinator.clone(), config.clone(), store, scheduler);

    let app = buildpilot_api::routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(buildpilot_api::cors_layer(&config.server_cors_origin));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!(%addr, "starting buildpilot-server");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await?;

    Ok(())
}

/// Waits for SIGINT/SIGTERM, then tells the coordinator to stop accepting
/// submissions and wind down every live pipeline, waiting up to
/// [`SHUTDOWN_GRACE`] before letting axum stop routing and the process exit.
async fn shutdown_signal(coordinator: Arc<Coordinator>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "shutdown signal received, draining");
    coordinator.shutdown(SHUTDOWN_GRACE).await;
}
