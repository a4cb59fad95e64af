use std::path::PathBuf;

use garde::Validate;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::api::CreateJobRequest;
use crate::models::job::{AreaOfInterest, Job};
use crate::services::storage::{StorageError, UploadStorage};
use crate::services::supervisor::{WorkerLaunch, WorkerSupervisor};

/// Request-facing entry point over the store and the supervisor.
#[derive(Clone)]
pub struct JobService {
    store: JobStore,
    supervisor: WorkerSupervisor,
    uploads: UploadStorage,
    outputs_root: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<StoreError> for JobServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobServiceError::NotFound(id.to_string()),
            other => JobServiceError::Store(other),
        }
    }
}

/// A create request that passed validation.
struct ValidJob {
    image_a_ref: String,
    image_b_ref: String,
    image_a: PathBuf,
    image_b: PathBuf,
    aoi: AreaOfInterest,
}

impl JobService {
    pub fn new(
        store: JobStore,
        supervisor: WorkerSupervisor,
        uploads: UploadStorage,
        outputs_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            supervisor,
            uploads,
            outputs_root: outputs_root.into(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub fn output_dir(&self, job_id: Uuid) -> PathBuf {
        self.outputs_root.join(job_id.to_string())
    }

    /// Validate, record a `Pending` job, and start its worker. Returns as soon
    /// as the record is durable; the worker runs in the background.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Uuid, JobServiceError> {
        let valid = self.validate(request)?;

        let job_id = Uuid::new_v4();
        let out_dir = self.output_dir(job_id);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|source| JobServiceError::OutputDir {
                path: out_dir.clone(),
                source,
            })?;

        let job = Job::pending(job_id, valid.image_a_ref, valid.image_b_ref, valid.aoi);
        if let Err(e) = self.store.create_job(&job).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&out_dir).await {
                tracing::warn!(
                    job_id = %job_id,
                    path = %out_dir.display(),
                    error = %cleanup,
                    "Failed to remove output directory of unrecorded job"
                );
            }
            return Err(e.into());
        }
        metrics::counter!("align_jobs_created_total").increment(1);

        tracing::info!(
            job_id = %job_id,
            image_a = %job.image_a_ref,
            image_b = %job.image_b_ref,
            aoi = %job.aoi,
            "Job created"
        );

        self.supervisor.run_job(WorkerLaunch {
            job_id,
            image_a: valid.image_a,
            image_b: valid.image_b,
            aoi: valid.aoi,
            out_dir,
        });

        Ok(job_id)
    }

    /// Read-through to the store.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Job, JobServiceError> {
        Ok(self.store.get_job(job_id).await?)
    }

    /// Same as [`get_job_status`](Self::get_job_status) for an id as received
    /// on the wire; anything that is not a UUID cannot name a job.
    pub async fn get_job_status_str(&self, job_id: &str) -> Result<Job, JobServiceError> {
        let id = Uuid::parse_str(job_id)
            .map_err(|_| JobServiceError::NotFound(job_id.to_string()))?;
        self.get_job_status(id).await
    }

    fn validate(&self, request: CreateJobRequest) -> Result<ValidJob, JobServiceError> {
        request
            .validate()
            .map_err(|report| JobServiceError::Validation(report.to_string()))?;

        let (Some(image_a_ref), Some(image_b_ref), Some(aoi)) =
            (request.image_a_ref, request.image_b_ref, request.aoi)
        else {
            return Err(JobServiceError::Validation("Missing data".to_string()));
        };

        aoi.check_geometry().map_err(JobServiceError::Validation)?;

        let resolve = |image_ref: &str| {
            self.uploads.resolve(image_ref).map_err(|e| match e {
                StorageError::InvalidRef(r) => {
                    JobServiceError::Validation(format!("invalid image reference {r:?}"))
                }
                other => JobServiceError::Validation(other.to_string()),
            })
        };
        let image_a = resolve(&image_a_ref)?;
        let image_b = resolve(&image_b_ref)?;

        Ok(ValidJob {
            image_a_ref,
            image_b_ref,
            image_a,
            image_b,
            aoi,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use crate::services::supervisor::WorkerConfig;
    use std::time::Duration;

    fn aoi() -> AreaOfInterest {
        AreaOfInterest {
            north: 20.5,
            south: 19.5,
            east: 79.5,
            west: 78.5,
        }
    }

    fn request() -> CreateJobRequest {
        CreateJobRequest {
            image_a_ref: Some("img-a".to_string()),
            image_b_ref: Some("img-b".to_string()),
            aoi: Some(aoi()),
        }
    }

    /// A service whose worker blocks until `release` appears in its output
    /// directory, so tests can observe the pending state deterministically.
    async fn service(dir: &std::path::Path) -> JobService {
        let store = JobStore::open(dir.join("jobs.json")).await.unwrap();
        let config = WorkerConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"for out; do :; done; while [ ! -e "$out/release" ]; do sleep 0.05; done; exit 1"#
                    .to_string(),
                "worker".to_string(),
            ],
            timeout: Some(Duration::from_secs(20)),
            output_extension: "tif".to_string(),
            output_url_prefix: "/data/outputs".to_string(),
            max_capture_bytes: 4096,
        };
        let supervisor = WorkerSupervisor::start(config, store.clone());
        let uploads = UploadStorage::open(dir.join("uploads")).await.unwrap();
        JobService::new(store, supervisor, uploads, dir.join("outputs"))
    }

    #[tokio::test]
    async fn test_create_is_immediately_readable_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let id = service.create_job(request()).await.unwrap();
        let job = service.get_job_status(id).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.outputs.is_none());
        assert!(job.error_detail.is_none());
        assert!(service.output_dir(id).is_dir());

        std::fs::write(service.output_dir(id).join("release"), b"").unwrap();
    }

    #[tokio::test]
    async fn test_identical_requests_get_distinct_ids_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let first = service.create_job(request()).await.unwrap();
        let second = service.create_job(request()).await.unwrap();

        assert_ne!(first, second);
        let (a, b) = (service.output_dir(first), service.output_dir(second));
        assert_ne!(a, b);
        assert!(!a.starts_with(&b) && !b.starts_with(&a));

        for id in [first, second] {
            std::fs::write(service.output_dir(id).join("release"), b"").unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_fields_create_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let cases = [
            CreateJobRequest {
                aoi: None,
                ..request()
            },
            CreateJobRequest {
                image_a_ref: None,
                ..request()
            },
            CreateJobRequest {
                image_b_ref: Some(String::new()),
                ..request()
            },
            CreateJobRequest::default(),
        ];

        for case in cases {
            let err = service.create_job(case).await.unwrap_err();
            assert!(matches!(err, JobServiceError::Validation(_)), "{err:?}");
        }

        assert!(service.store().list_jobs().await.unwrap().is_empty());
        assert!(!dir.path().join("outputs").exists());
        assert_eq!(service.supervisor().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_bad_geometry_and_refs_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let flipped = CreateJobRequest {
            aoi: Some(AreaOfInterest {
                north: 1.0,
                south: 2.0,
                ..aoi()
            }),
            ..request()
        };
        let traversal = CreateJobRequest {
            image_a_ref: Some("../jobs.json".to_string()),
            ..request()
        };

        for case in [flipped, traversal] {
            assert!(matches!(
                service.create_job(case).await,
                Err(JobServiceError::Validation(_))
            ));
        }
        assert!(service.store().list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_record_write_leaves_no_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        std::fs::create_dir(dir.path().join("jobs.json.tmp")).unwrap();

        let err = service.create_job(request()).await.unwrap_err();

        assert!(matches!(err, JobServiceError::Store(_)), "{err:?}");
        let outputs = dir.path().join("outputs");
        assert_eq!(std::fs::read_dir(&outputs).map(|d| d.count()).unwrap_or(0), 0);
        assert_eq!(service.supervisor().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        assert!(matches!(
            service.get_job_status(Uuid::new_v4()).await,
            Err(JobServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.get_job_status_str("not-a-uuid").await,
            Err(JobServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_failure_is_only_visible_through_status() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let id = service.create_job(request()).await.unwrap();
        std::fs::write(service.output_dir(id).join("release"), b"").unwrap();

        let mut job = service.get_job_status(id).await.unwrap();
        for _ in 0..200 {
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            job = service.get_job_status(id).await.unwrap();
        }

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_detail.unwrap().contains("code 1"));
        assert!(job.outputs.is_none());
    }
}
