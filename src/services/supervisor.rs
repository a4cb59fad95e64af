use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::JobStore;
use crate::models::job::{AreaOfInterest, JobOutputs, WorkerOutcome};

/// How long to keep draining output pipes after the worker exits. A
/// grandchild that inherited the pipes could otherwise hold them open.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

const READ_CHUNK_BYTES: usize = 8 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// How to launch the external alignment worker and interpret its results.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub output_extension: String,
    pub output_url_prefix: String,
    pub max_capture_bytes: usize,
}

impl WorkerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            program: config.worker_program.clone(),
            args: config.worker_args.clone(),
            timeout: config.worker_timeout(),
            output_extension: config.output_extension.clone(),
            output_url_prefix: config.output_url_prefix.clone(),
            max_capture_bytes: config.max_capture_bytes,
        }
    }

    /// File names the worker must produce inside the job's output directory.
    pub fn output_file_names(&self) -> [String; 2] {
        [
            format!("A_clipped.{}", self.output_extension),
            format!("B_clipped_aligned.{}", self.output_extension),
        ]
    }

    fn output_url(&self, job_id: Uuid, file_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.output_url_prefix.trim_end_matches('/'),
            job_id,
            file_name
        )
    }
}

/// Everything one worker run needs.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub job_id: Uuid,
    pub image_a: PathBuf,
    pub image_b: PathBuf,
    pub aoi: AreaOfInterest,
    pub out_dir: PathBuf,
}

impl WorkerLaunch {
    fn job_args(&self) -> Vec<std::ffi::OsString> {
        vec![
            "--image_a".into(),
            self.image_a.clone().into(),
            "--image_b".into(),
            self.image_b.clone().into(),
            "--aoi".into(),
            self.aoi.to_string().into(),
            "--out_dir".into(),
            self.out_dir.clone().into(),
        ]
    }
}

#[derive(Debug)]
struct Completion {
    job_id: Uuid,
    outcome: WorkerOutcome,
}

/// Launches one worker process per job and reports each exit to a single
/// completion recorder, which is the only writer of terminal job states.
#[derive(Clone)]
pub struct WorkerSupervisor {
    config: Arc<WorkerConfig>,
    completions: mpsc::UnboundedSender<Completion>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerSupervisor {
    /// Start the completion recorder for `store`. Must be called inside a
    /// tokio runtime.
    pub fn start(config: WorkerConfig, store: JobStore) -> Self {
        Self::start_with_retry(config, store, RecordRetry::default())
    }

    /// Like [`start`](Self::start), with an explicit policy for terminal
    /// writes the store rejects.
    pub fn start_with_retry(config: WorkerConfig, store: JobStore, retry: RecordRetry) -> Self {
        let (completions, rx) = mpsc::unbounded_channel();
        tokio::spawn(record_completions(store, rx, retry));

        Self {
            config: Arc::new(config),
            completions,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Number of workers currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run the worker for `launch` in the background. Returns immediately.
    pub fn run_job(&self, launch: WorkerLaunch) -> JoinHandle<()> {
        let config = Arc::clone(&self.config);
        let completions = self.completions.clone();
        let guard = InFlightGuard::new(Arc::clone(&self.in_flight));

        tokio::spawn(async move {
            let start = Instant::now();
            let outcome = execute(&config, &launch).await;
            metrics::histogram!("align_worker_duration_seconds")
                .record(start.elapsed().as_secs_f64());

            if completions
                .send(Completion {
                    job_id: launch.job_id,
                    outcome,
                })
                .is_err()
            {
                tracing::error!(job_id = %launch.job_id, "Completion recorder is gone, worker result lost");
            }
            drop(guard);
        })
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("align_workers_in_flight").set(now as f64);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("align_workers_in_flight").set(now as f64);
    }
}

/// How the recorder handles a terminal write the store fails to persist.
///
/// Each completion gets `attempts` tries with doubling backoff starting at
/// `backoff`. A completion that still fails is held and retried every
/// `requeue_interval` until the store accepts it.
#[derive(Debug, Clone, Copy)]
pub struct RecordRetry {
    pub attempts: u32,
    pub backoff: Duration,
    pub requeue_interval: Duration,
}

impl Default for RecordRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(100),
            requeue_interval: Duration::from_secs(5),
        }
    }
}

async fn record_completions(
    store: JobStore,
    mut rx: mpsc::UnboundedReceiver<Completion>,
    retry: RecordRetry,
) {
    let mut unrecorded: VecDeque<Completion> = VecDeque::new();
    let mut requeue = tokio::time::interval(retry.requeue_interval);
    requeue.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(completion) = received else { break };
                if let Err(completion) = record_with_retry(&store, completion, retry).await {
                    tracing::error!(
                        job_id = %completion.job_id,
                        attempts = retry.attempts,
                        "Worker result not recorded, holding it for a later attempt"
                    );
                    unrecorded.push_back(completion);
                }
            }
            _ = requeue.tick(), if !unrecorded.is_empty() => {
                for _ in 0..unrecorded.len() {
                    let Some(completion) = unrecorded.pop_front() else { break };
                    if let Err(completion) = record(&store, completion).await {
                        unrecorded.push_back(completion);
                    }
                }
            }
        }
        metrics::gauge!("align_unrecorded_results").set(unrecorded.len() as f64);
    }

    for completion in unrecorded {
        if let Err(completion) = record(&store, completion).await {
            tracing::error!(job_id = %completion.job_id, "Worker result lost at shutdown");
        }
    }
    tracing::debug!("Completion recorder stopped");
}

async fn record_with_retry(
    store: &JobStore,
    mut completion: Completion,
    retry: RecordRetry,
) -> Result<(), Completion> {
    let mut delay = retry.backoff;
    for attempt in 1..=retry.attempts.max(1) {
        completion = match record(store, completion).await {
            Ok(()) => return Ok(()),
            Err(completion) => completion,
        };
        if attempt < retry.attempts {
            tracing::warn!(job_id = %completion.job_id, attempt, "Retrying terminal write");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }
    Err(completion)
}

/// Apply one completion. Hands it back only when the store itself failed,
/// so the caller can try again.
async fn record(store: &JobStore, completion: Completion) -> Result<(), Completion> {
    let job_id = completion.job_id;
    let outcome = completion.outcome.clone();
    let succeeded = matches!(outcome, WorkerOutcome::Succeeded(_));

    match store.update_job(job_id, |job| job.finish(outcome)).await {
        Ok(Some(Ok(()))) if succeeded => {
            metrics::counter!("align_jobs_completed_total").increment(1);
            tracing::info!(job_id = %job_id, "Job done");
        }
        Ok(Some(Ok(()))) => {
            metrics::counter!("align_jobs_failed_total").increment(1);
            tracing::warn!(job_id = %job_id, "Job failed");
        }
        Ok(Some(Err(e))) => {
            tracing::error!(job_id = %job_id, error = %e, "Refusing second terminal write");
        }
        // The store already logged the miss.
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to record worker result");
            return Err(completion);
        }
    }
    Ok(())
}

/// Run one worker to completion and decide the job's terminal outcome.
///
/// Never panics and never returns an error: launch failures, timeouts and
/// nonzero exits all become [`WorkerOutcome::Failed`].
pub async fn execute(config: &WorkerConfig, launch: &WorkerLaunch) -> WorkerOutcome {
    let job_id = launch.job_id;

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .args(launch.job_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::info!(
        job_id = %job_id,
        program = %config.program,
        aoi = %launch.aoi,
        out_dir = %launch.out_dir.display(),
        "Launching worker"
    );

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(job_id = %job_id, program = %config.program, error = %e, "Worker failed to launch");
            return WorkerOutcome::Failed(format!(
                "Failed to launch worker `{}`: {}",
                config.program, e
            ));
        }
    };

    let cap = config.max_capture_bytes;
    let mut stdout_task = tokio::spawn(capture(child.stdout.take(), job_id, "stdout", cap));
    let mut stderr_task = tokio::spawn(capture(child.stderr.take(), job_id, "stderr", cap));

    let waited = match config.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                tracing::warn!(job_id = %job_id, timeout_secs = limit.as_secs_f64(), "Worker timed out, killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to kill timed out worker");
                }
                stdout_task.abort();
                stderr_task.abort();
                return WorkerOutcome::Failed(format!(
                    "Worker timed out after {}s",
                    limit.as_secs_f64()
                ));
            }
        },
        None => child.wait().await,
    };

    let status = match waited {
        Ok(status) => status,
        Err(e) => {
            stdout_task.abort();
            stderr_task.abort();
            tracing::error!(job_id = %job_id, error = %e, "Failed to wait for worker");
            return WorkerOutcome::Failed(format!("Failed to wait for worker: {e}"));
        }
    };

    let stdout = drain(&mut stdout_task).await;
    let stderr = drain(&mut stderr_task).await;

    tracing::info!(
        job_id = %job_id,
        exit_code = ?status.code(),
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "Worker exited"
    );

    resolve(config, launch, status, &stderr).await
}

/// Turn an exit status into an outcome. Exit 0 only counts as success when
/// both expected artifacts are actually present.
async fn resolve(
    config: &WorkerConfig,
    launch: &WorkerLaunch,
    status: ExitStatus,
    stderr: &str,
) -> WorkerOutcome {
    if !status.success() {
        let stderr = stderr.trim();
        return WorkerOutcome::Failed(match status.code() {
            Some(code) => format!("Worker exited with code {code}. Error: {stderr}"),
            None => format!("Worker terminated by signal. Error: {stderr}"),
        });
    }

    let names = config.output_file_names();
    let mut missing = Vec::new();
    for name in &names {
        if !is_file(&launch.out_dir.join(name)).await {
            missing.push(name.as_str());
        }
    }

    if !missing.is_empty() {
        tracing::warn!(job_id = %launch.job_id, missing = ?missing, "Worker exited 0 without its outputs");
        return WorkerOutcome::Failed(format!(
            "Worker exited with code 0 but did not produce: {}",
            missing.join(", ")
        ));
    }

    let [a, b] = names;
    WorkerOutcome::Succeeded(JobOutputs {
        image_a_url: config.output_url(launch.job_id, &a),
        image_b_url: config.output_url(launch.job_id, &b),
    })
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn drain(task: &mut JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut *task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Output capture task failed");
            String::new()
        }
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

/// Read a worker stream to EOF, logging each chunk and keeping at most `cap`
/// bytes. Bytes past the cap are still read so the worker never blocks on a
/// full pipe.
async fn capture<R: AsyncRead + Unpin>(
    stream: Option<R>,
    job_id: Uuid,
    name: &'static str,
    cap: usize,
) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(job_id = %job_id, stream = name, error = %e, "Error reading worker output");
                break;
            }
        };

        tracing::debug!(
            job_id = %job_id,
            stream = name,
            output = %String::from_utf8_lossy(&chunk[..n]).trim_end(),
            "Worker output"
        );

        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}
