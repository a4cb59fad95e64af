use std::fmt;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Status of an alignment job.
///
/// Serialized verbatim (`"Pending"`, `"Done"`, ...), which is the wire format
/// polling clients match on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// `Done` and `Error` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether `next` may follow `self`. Staying in the same state is allowed
    /// so repeated observations by a poller are legal.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            JobStatus::Pending => true,
            JobStatus::Running => next.is_terminal(),
            JobStatus::Done | JobStatus::Error => false,
        }
    }
}

/// Rectangular lat/long bounding region, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct AreaOfInterest {
    #[garde(range(min = -90.0, max = 90.0))]
    pub north: f64,

    #[garde(range(min = -90.0, max = 90.0))]
    pub south: f64,

    #[garde(range(min = -180.0, max = 180.0))]
    pub east: f64,

    #[garde(range(min = -180.0, max = 180.0))]
    pub west: f64,
}

impl AreaOfInterest {
    /// Check finiteness and ordering of the bounds.
    pub fn check_geometry(&self) -> Result<(), String> {
        let all = [self.north, self.south, self.east, self.west];
        if all.iter().any(|v| !v.is_finite()) {
            return Err("aoi bounds must be finite numbers".to_string());
        }
        if self.north <= self.south {
            return Err(format!(
                "aoi north ({}) must be greater than south ({})",
                self.north, self.south
            ));
        }
        if self.east <= self.west {
            return Err(format!(
                "aoi east ({}) must be greater than west ({})",
                self.east, self.west
            ));
        }
        Ok(())
    }
}

/// Compact encoding handed to the worker: `north=..;south=..;east=..;west=..`.
impl fmt::Display for AreaOfInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "north={};south={};east={};west={}",
            self.north, self.south, self.east, self.west
        )
    }
}

/// Locations of the two artifacts a successful worker run produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutputs {
    pub image_a_url: String,
    pub image_b_url: String,
}

/// How a worker run ended, as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Succeeded(JobOutputs),
    Failed(String),
}

/// One request to align two uploaded images over an AOI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "jobId")]
    pub id: Uuid,
    pub status: JobStatus,
    #[serde(rename = "imageARef", alias = "imageAId")]
    pub image_a_ref: String,
    #[serde(rename = "imageBRef", alias = "imageBId")]
    pub image_b_ref: String,
    pub aoi: AreaOfInterest,
    pub outputs: Option<JobOutputs>,
    #[serde(rename = "error")]
    pub error_detail: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Job {
    /// A freshly created job, not yet picked up by a worker.
    pub fn pending(id: Uuid, image_a_ref: String, image_b_ref: String, aoi: AreaOfInterest) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            image_a_ref,
            image_b_ref,
            aoi,
            outputs: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a worker outcome. Refuses once the job is terminal, which is
    /// what keeps terminal writes to exactly one per job.
    pub fn finish(&mut self, outcome: WorkerOutcome) -> Result<(), TransitionError> {
        let next = match outcome {
            WorkerOutcome::Succeeded(_) => JobStatus::Done,
            WorkerOutcome::Failed(_) => JobStatus::Error,
        };
        if self.status.is_terminal() {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }

        match outcome {
            WorkerOutcome::Succeeded(outputs) => {
                self.outputs = Some(outputs);
                self.error_detail = None;
            }
            WorkerOutcome::Failed(detail) => {
                self.outputs = None;
                self.error_detail = Some(detail);
            }
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aoi() -> AreaOfInterest {
        AreaOfInterest {
            north: 20.5,
            south: 19.5,
            east: 79.5,
            west: 78.5,
        }
    }

    #[test]
    fn test_aoi_compact_encoding() {
        assert_eq!(aoi().to_string(), "north=20.5;south=19.5;east=79.5;west=78.5");

        let whole = AreaOfInterest {
            north: 20.0,
            south: -3.25,
            east: 1.0,
            west: 0.0,
        };
        assert_eq!(whole.to_string(), "north=20;south=-3.25;east=1;west=0");
    }

    #[test]
    fn test_aoi_geometry_checks() {
        assert!(aoi().check_geometry().is_ok());

        let flipped = AreaOfInterest {
            north: 19.5,
            south: 20.5,
            ..aoi()
        };
        assert!(flipped.check_geometry().unwrap_err().contains("north"));

        let inverted = AreaOfInterest {
            east: 78.0,
            ..aoi()
        };
        assert!(inverted.check_geometry().unwrap_err().contains("east"));

        let nan = AreaOfInterest {
            west: f64::NAN,
            ..aoi()
        };
        assert!(nan.check_geometry().is_err());
    }

    #[test]
    fn test_aoi_range_validation() {
        assert!(aoi().validate().is_ok());
        let off_globe = AreaOfInterest {
            north: 95.0,
            ..aoi()
        };
        assert!(off_globe.validate().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Done));
        assert!(Pending.can_transition_to(Error));
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Done.can_transition_to(Error));
        assert!(!Error.can_transition_to(Done));
        assert!(!Done.can_transition_to(Pending));
        assert!(Done.can_transition_to(Done));
    }

    #[test]
    fn test_finish_sets_exactly_one_terminal_state() {
        let mut job = Job::pending(Uuid::new_v4(), "a.tif".into(), "b.tif".into(), aoi());
        job.finish(WorkerOutcome::Failed("bad AOI".into())).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_detail.as_deref(), Some("bad AOI"));
        assert!(job.outputs.is_none());

        let err = job
            .finish(WorkerOutcome::Succeeded(JobOutputs {
                image_a_url: "a".into(),
                image_b_url: "b".into(),
            }))
            .unwrap_err();
        assert_eq!(err.from, JobStatus::Error);
        assert_eq!(err.to, JobStatus::Done);
        assert_eq!(job.status, JobStatus::Error);
    }

    #[test]
    fn test_job_wire_format() {
        let job = Job::pending(Uuid::new_v4(), "img-a".into(), "img-b".into(), aoi());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["jobId"], job.id.to_string());
        assert_eq!(value["status"], "Pending");
        assert_eq!(value["imageARef"], "img-a");
        assert!(value["outputs"].is_null());
        assert!(value["error"].is_null());

        // Records written with the original field names still load.
        let legacy = serde_json::json!({
            "jobId": job.id,
            "status": "Done",
            "imageAId": "x",
            "imageBId": "y",
            "aoi": {"north": 1.0, "south": 0.0, "east": 1.0, "west": 0.0},
            "outputs": {"imageAUrl": "/a", "imageBUrl": "/b"},
            "error": null
        });
        let parsed: Job = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.image_a_ref, "x");
        assert_eq!(parsed.status, JobStatus::Done);
    }
}
