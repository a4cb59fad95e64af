use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Durable job table backed by a single JSON file.
///
/// Every read-modify-write cycle (create, update, recovery) holds `write_lock`
/// for its whole duration, so two jobs completing at the same moment cannot
/// clobber each other's records. Writes go to a sibling temp file that is
/// renamed over the table, so lock-free readers always see a complete table.
#[derive(Clone)]
pub struct JobStore {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job table I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job table is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("job {0} already exists")]
    DuplicateId(Uuid),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("failed to serialize job table: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl JobStore {
    /// Open the table at `path`, creating it (and its parent directory) empty
    /// if it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let store = Self {
            path: Arc::new(path),
            write_lock: Arc::new(Mutex::new(())),
        };

        match tokio::fs::metadata(store.path()).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %store.path().display(), "Initializing empty job table");
                store.persist(&[]).await?;
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: store.path().to_path_buf(),
                    source,
                })
            }
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new record.
    pub async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load_for_write().await?;

        if jobs.iter().any(|j| j.id == job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }

        jobs.push(job.clone());
        self.persist(&jobs).await?;

        tracing::debug!(job_id = %job.id, total = jobs.len(), "Job record created");
        Ok(())
    }

    /// Apply `mutate` to the record for `id` and write the table back.
    ///
    /// Returns `Ok(None)` without writing anything when no such record exists.
    pub async fn update_job<F, R>(&self, id: Uuid, mutate: F) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load_for_write().await?;

        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            tracing::warn!(job_id = %id, "Update addressed to unknown job, ignoring");
            return Ok(None);
        };

        let result = mutate(job);
        self.persist(&jobs).await?;
        Ok(Some(result))
    }

    /// Point lookup. Returns a copy; mutations must go through `update_job`.
    pub async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        self.load_recovering()
            .await?
            .into_iter()
            .find(|j| j.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.load_recovering().await
    }

    /// Fail every job a previous process left unfinished. Their exit handlers
    /// died with that process, so they would otherwise stay pending forever.
    pub async fn fail_orphaned(&self, reason: &str) -> Result<Vec<Uuid>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load_for_write().await?;

        let now = Utc::now();
        let mut failed = Vec::new();
        for job in jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
            job.status = JobStatus::Error;
            job.outputs = None;
            job.error_detail = Some(reason.to_string());
            job.updated_at = now;
            failed.push(job.id);
        }

        if !failed.is_empty() {
            self.persist(&jobs).await?;
            tracing::warn!(count = failed.len(), "Marked orphaned jobs as failed");
        }
        Ok(failed)
    }

    /// Whether the table can currently be read and parsed.
    pub async fn check_readable(&self) -> Result<usize, StoreError> {
        self.load().await.map(|jobs| jobs.len())
    }

    async fn load(&self) -> Result<Vec<Job>, StoreError> {
        let bytes = match tokio::fs::read(self.path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path().to_path_buf(),
                    source,
                })
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(StoreError::Corrupt(serde_json::Error::io(
                std::io::Error::new(ErrorKind::UnexpectedEof, "job table is empty"),
            )));
        }

        serde_json::from_slice(&bytes).map_err(StoreError::Corrupt)
    }

    /// Read path: a corrupt table reads as empty.
    async fn load_recovering(&self) -> Result<Vec<Job>, StoreError> {
        match self.load().await {
            Err(StoreError::Corrupt(e)) => {
                tracing::warn!(error = %e, path = %self.path().display(), "Job table is corrupt, treating as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Write path: a corrupt table is moved aside before it gets overwritten,
    /// then treated as empty. Caller must hold `write_lock`.
    async fn load_for_write(&self) -> Result<Vec<Job>, StoreError> {
        match self.load().await {
            Err(StoreError::Corrupt(e)) => {
                let backup = self.corrupt_backup_path();
                tracing::warn!(
                    error = %e,
                    path = %self.path().display(),
                    backup = %backup.display(),
                    "Job table is corrupt, preserving it and starting empty"
                );
                tokio::fs::rename(self.path(), &backup)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: backup.clone(),
                        source,
                    })?;
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn corrupt_backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let mut name = self
            .path()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "jobs.json".into());
        name.push(format!(".corrupt-{stamp}"));
        self.path().with_file_name(name)
    }

    async fn persist(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(jobs).map_err(StoreError::Serialize)?;

        let mut tmp_name = self
            .path()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "jobs.json".into());
        tmp_name.push(".tmp");
        let tmp_path = self.path().with_file_name(tmp_name);

        let io_err = |source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        };

        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(&payload).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&tmp_path, self.path())
            .await
            .map_err(|source| StoreError::Io {
                path: self.path().to_path_buf(),
                source,
            })
    }
}
