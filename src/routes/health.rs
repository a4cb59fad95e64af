use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub job_store: ComponentHealth,
    pub workers_in_flight: usize,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    pub jobs: Option<usize>,
}

/// GET /health: job table readability and worker load.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let job_store = match state.jobs.store().check_readable().await {
        Ok(count) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            jobs: Some(count),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read job table");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
                jobs: None,
            }
        }
    };

    let healthy = job_store.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            job_store,
            workers_in_flight: state.jobs.supervisor().in_flight(),
        },
    };

    (status_code, Json(response))
}
