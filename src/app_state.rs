use std::sync::Arc;

use crate::config::{AppConfig, ConfigError};
use crate::db::{JobStore, StoreError};
use crate::services::{
    jobs::JobService,
    storage::{StorageError, UploadStorage},
    supervisor::{WorkerConfig, WorkerSupervisor},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobService,
    pub uploads: UploadStorage,
    pub config: Arc<AppConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("job store: {0}")]
    Store(#[from] StoreError),

    #[error("upload storage: {0}")]
    Uploads(#[from] StorageError),

    #[error("output directory {path}: {source}")]
    Outputs {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AppState {
    /// Open the store and directories named by `config` and start the worker
    /// supervisor. Must be called inside a tokio runtime.
    pub async fn init(config: AppConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let store = JobStore::open(&config.jobs_file).await?;
        let uploads = UploadStorage::open(&config.upload_dir).await?;
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|source| StartupError::Outputs {
                path: config.output_dir.clone(),
                source,
            })?;

        let supervisor = WorkerSupervisor::start(WorkerConfig::from_app_config(&config), store.clone());
        let jobs = JobService::new(store, supervisor, uploads.clone(), config.output_dir.clone());

        Ok(Self {
            jobs,
            uploads,
            config: Arc::new(config),
        })
    }
}
