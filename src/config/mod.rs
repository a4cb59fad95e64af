use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory uploaded images are stored in, one file per image id.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Root of the per-job output directories.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// JSON file holding the job table.
    #[serde(default = "default_jobs_file")]
    pub jobs_file: PathBuf,

    /// Program used to launch the alignment worker.
    #[serde(default = "default_worker_program")]
    pub worker_program: String,

    /// Arguments placed before the per-job arguments (comma separated in the
    /// environment, e.g. `WORKER_ARGS=worker/worker.py`).
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,

    /// Kill the worker and fail the job after this many seconds. Unset means
    /// the worker may run indefinitely.
    #[serde(default)]
    pub worker_timeout_secs: Option<u64>,

    /// File extension of the worker's output artifacts.
    #[serde(default = "default_output_extension")]
    pub output_extension: String,

    /// URL prefix output artifacts are served under.
    #[serde(default = "default_output_url_prefix")]
    pub output_url_prefix: String,

    /// Per-stream cap on captured worker stdout/stderr.
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,

    /// Request body limit, which bounds upload size.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/outputs")
}

fn default_jobs_file() -> PathBuf {
    PathBuf::from("data/jobs.json")
}

fn default_worker_program() -> String {
    "python3".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["worker/worker.py".to_string()]
}

fn default_output_extension() -> String {
    "tif".to_string()
}

fn default_output_url_prefix() -> String {
    "/data/outputs".to_string()
}

fn default_max_capture_bytes() -> usize {
    1024 * 1024
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] envy::Error),

    #[error("OUTPUT_URL_PREFIX must start with '/' and name a path below the root, got {0:?}")]
    OutputUrlPrefix(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the router cannot mount.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.output_url_prefix.trim_end_matches('/');
        if !prefix.starts_with('/') || prefix.contains(['{', '}', '*']) {
            return Err(ConfigError::OutputUrlPrefix(self.output_url_prefix.clone()));
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        self.worker_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            upload_dir: default_upload_dir(),
            output_dir: default_output_dir(),
            jobs_file: default_jobs_file(),
            worker_program: default_worker_program(),
            worker_args: default_worker_args(),
            worker_timeout_secs: None,
            output_extension: default_output_extension(),
            output_url_prefix: default_output_url_prefix(),
            max_capture_bytes: default_max_capture_bytes(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}
