use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod upload;

/// All application routes with their middleware.
///
/// Output artifacts are served straight from the output directory under the
/// configured URL prefix, which is also the prefix recorded in job outputs.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    let outputs = ServeDir::new(&state.config.output_dir);
    let outputs_prefix = state.config.output_url_prefix.trim_end_matches('/').to_string();

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/upload", post(upload::upload_image))
        .route("/api/jobs", post(jobs::create_job))
        .route("/api/jobs/{job_id}", get(jobs::get_job_status))
        .nest_service(&outputs_prefix, outputs)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
