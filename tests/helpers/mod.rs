//! Test helper utilities for router-level and end-to-end tests

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use aoi_align::app_state::AppState;
use aoi_align::config::AppConfig;
use aoi_align::models::job::Job;
use aoi_align::routes;
use aoi_align::services::polling::{poll_until_terminal, PollPolicy};

/// Configuration rooted in `dir`, running `script` through `sh -c`.
pub fn test_config(dir: &Path, script: &str) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        upload_dir: dir.join("uploads"),
        output_dir: dir.join("outputs"),
        jobs_file: dir.join("jobs.json"),
        worker_program: "sh".to_string(),
        worker_args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        worker_timeout_secs: Some(30),
        max_upload_bytes: 1024 * 1024,
        ..AppConfig::default()
    }
}

pub async fn build_app(dir: &Path, script: &str) -> (Router, AppState) {
    let state = AppState::init(test_config(dir, script))
        .await
        .expect("init state");
    (routes::router(state.clone()), state)
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response")
}

pub async fn post_json(app: &Router, uri: &str, body: &Value) -> Response<Body> {
    post_raw(app, uri, "application/json", body.to_string().into_bytes()).await
}

pub async fn post_raw(app: &Router, uri: &str, content_type: &str, body: Vec<u8>) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::post(uri)
                .header("content-type", content_type)
                .body(Body::from(body))
                .expect("request"),
        )
        .await
        .expect("response")
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

/// Multipart body with a single field, returned with its content type.
pub fn multipart_body(field: &str, filename: &str, data: &[u8]) -> (String, Vec<u8>) {
    let boundary = "----align-test-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

/// Create a job through the router and return its id.
pub async fn create_job(app: &Router, request: &Value) -> String {
    let response = post_json(app, "/api/jobs", request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    json["jobId"].as_str().expect("jobId").to_string()
}

/// Poll the status route until the job is terminal.
pub async fn wait_for_job(app: &Router, job_id: &str) -> Job {
    let uri = format!("/api/jobs/{job_id}");
    let policy = PollPolicy {
        interval: Duration::from_millis(20),
        timeout: Duration::from_secs(20),
    };
    poll_until_terminal(policy, || {
        let app = app.clone();
        let uri = uri.clone();
        async move {
            let response = get(&app, &uri).await;
            if response.status() != StatusCode::OK {
                return Err(format!("status route returned {}", response.status()));
            }
            serde_json::from_slice::<Job>(&body_bytes(response).await).map_err(|e| e.to_string())
        }
    })
    .await
    .expect("job reaches a terminal state")
}
