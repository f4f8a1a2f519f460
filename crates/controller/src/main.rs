//! Preoom controller - pre-empts out-of-memory kills
//!
//! Watches opted-in pods and evicts them before the kernel OOM killer
//! reaches them, driven by a memory-usage threshold annotation and an
//! optional cron restart schedule.

use anyhow::{Context, Result};
use controller_lib::{
    controller::Controller,
    health::{components, HealthRegistry},
    observability::ControllerMetrics,
    pinger::PingerLoop,
};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod k8s;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bound on the whole shutdown sequence once a signal arrives.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = CONTROLLER_VERSION, "starting preoom-controller");

    // Load configuration
    let config = config::AppConfig::load()?;
    info!(
        interval_secs = config.interval_secs,
        pod_label_selector = config.pod_label_selector.as_str(),
        min_pod_age_secs = config.min_pod_age_before_eviction_secs,
        "controller configured"
    );

    // Initialize metrics and health registry
    let _metrics = ControllerMetrics::new();
    let health_registry = HealthRegistry::new();
    health_registry.register(components::CONTROLLER).await;

    // Create the cluster client and the repository adapter
    let client = Client::try_default()
        .await
        .context("create kubernetes client")?;
    let repo = Arc::new(k8s::KubeRepository::new(client));

    let controller = Controller::new(repo, config.controller_config());

    // Start health and metrics server
    let shutdown_token = CancellationToken::new();
    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_token.clone(),
    ));

    // Start the reconcile loop and the health pinger
    controller.start();
    let mut pinger = PingerLoop::new(health_registry.clone(), config.pinger_interval());
    pinger.register(controller.clone());
    let pinger_handle = tokio::spawn(pinger.run(shutdown_token.clone()));

    controller.ready().await;
    health_registry.set_ready(true).await;
    info!("controller ready");

    wait_for_signal().await?;
    info!("received termination signal, shutting down");

    health_registry.set_ready(false).await;
    shutdown_token.cancel();

    if let Err(shutdown_error) = controller.shutdown(SHUTDOWN_TIMEOUT).await {
        error!(error = %shutdown_error, "controller shutdown incomplete");
    }
    if let Err(join_error) = pinger_handle.await {
        error!(error = %join_error, "pinger task failed");
    }
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(serve_error)) => error!(error = %serve_error, "API server failed"),
        Err(join_error) => error!(error = %join_error, "API server task failed"),
    }

    info!("preoom-controller stopped");

    Ok(())
}

/// Block until SIGTERM or SIGINT arrives.
async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("install SIGINT handler")?,
        _ = sigterm.recv() => {}
    }

    Ok(())
}
