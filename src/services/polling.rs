//! Client side of the status polling protocol.
//!
//! Completion is never pushed; a client fetches the job record on an
//! interval until it sees `Done` or `Error`. Every observation is checked
//! against the previous one, so a server that ever reports a job moving
//! backwards (or from one terminal state to another) is caught.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::job::{Job, JobStatus};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("job still {last:?} after {elapsed:?}")]
    Timeout { last: JobStatus, elapsed: Duration },

    #[error("job status went from {from} to {to}")]
    Regressed { from: JobStatus, to: JobStatus },

    #[error("status fetch failed: {0}")]
    Fetch(E),
}

/// Poll `fetch` until the job is terminal and return that final record.
pub async fn poll_until_terminal<F, Fut, E>(policy: PollPolicy, mut fetch: F) -> Result<Job, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Job, E>>,
{
    let started = Instant::now();
    let mut previous: Option<JobStatus> = None;

    loop {
        let job = fetch().await.map_err(PollError::Fetch)?;

        if let Some(from) = previous {
            if !from.can_transition_to(job.status) {
                return Err(PollError::Regressed {
                    from,
                    to: job.status,
                });
            }
        }
        if previous != Some(job.status) {
            tracing::debug!(job_id = %job.id, status = %job.status, "Observed job status");
        }
        previous = Some(job.status);

        if job.status.is_terminal() {
            return Ok(job);
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(PollError::Timeout {
                last: job.status,
                elapsed,
            });
        }

        tokio::time::sleep(policy.interval.min(policy.timeout - elapsed)).await;
    }
}
