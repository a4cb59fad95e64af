use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use aoi_align::{app_state::AppState, config::AppConfig, routes};

const ORPHANED_JOB_REASON: &str =
    "Server restarted before the worker finished; the job was abandoned";

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let bind_addr = config.bind_addr.clone();

    tracing::info!("Initializing aoi-align server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("align_jobs_created_total", "Total alignment jobs created");
    metrics::describe_counter!(
        "align_jobs_completed_total",
        "Total alignment jobs whose worker produced both outputs"
    );
    metrics::describe_counter!(
        "align_jobs_failed_total",
        "Total alignment jobs that ended in the Error state"
    );
    metrics::describe_gauge!("align_workers_in_flight", "Worker processes currently running");
    metrics::describe_gauge!(
        "align_unrecorded_results",
        "Worker results waiting for the job store to accept them"
    );
    metrics::describe_histogram!(
        "align_worker_duration_seconds",
        "Wall-clock time from worker launch to exit"
    );

    tracing::info!(
        jobs_file = %config.jobs_file.display(),
        upload_dir = %config.upload_dir.display(),
        output_dir = %config.output_dir.display(),
        worker = %config.worker_program,
        "Opening job store and storage directories"
    );
    let state = AppState::init(config)
        .await
        .expect("Failed to initialize application state");

    // Workers from a previous process can no longer report back
    let orphaned = state
        .jobs
        .store()
        .fail_orphaned(ORPHANED_JOB_REASON)
        .await
        .expect("Failed to recover unfinished jobs");
    if !orphaned.is_empty() {
        tracing::warn!(count = orphaned.len(), "Failed jobs left unfinished by a previous run");
    }

    let app = routes::router(state).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    tracing::info!("Starting aoi-align on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
