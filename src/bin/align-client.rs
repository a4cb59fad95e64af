use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use aoi_align::models::api::{CreateJobRequest, CreateJobResponse, UploadResponse};
use aoi_align::models::job::{AreaOfInterest, Job, JobStatus};
use aoi_align::services::polling::{poll_until_terminal, PollPolicy};
use clap::Parser;
use reqwest::multipart;
use tracing_subscriber::EnvFilter;

/// Upload two images, align them over an AOI, and wait for the result.
#[derive(Debug, Parser)]
#[command(name = "align-client", version)]
struct Args {
    /// Base URL of the aoi-align server
    #[arg(long, env = "ALIGN_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Reference image
    #[arg(long)]
    image_a: PathBuf,

    /// Image to align onto the reference
    #[arg(long)]
    image_b: PathBuf,

    #[arg(long, allow_hyphen_values = true)]
    north: f64,

    #[arg(long, allow_hyphen_values = true)]
    south: f64,

    #[arg(long, allow_hyphen_values = true)]
    east: f64,

    #[arg(long, allow_hyphen_values = true)]
    west: f64,

    /// Milliseconds between status polls
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(job) => {
            match serde_json::to_string_pretty(&job) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("Failed to render job: {e}"),
            }
            if job.status == JobStatus::Done {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<Job, Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let base = args.server.trim_end_matches('/').to_string();

    let image_a = upload(&client, &base, &args.image_a).await?;
    let image_b = upload(&client, &base, &args.image_b).await?;

    let request = CreateJobRequest {
        image_a_ref: Some(image_a.image_id),
        image_b_ref: Some(image_b.image_id),
        aoi: Some(AreaOfInterest {
            north: args.north,
            south: args.south,
            east: args.east,
            west: args.west,
        }),
    };

    let response = client
        .post(format!("{base}/api/jobs"))
        .json(&request)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await?;
        return Err(format!("Job creation failed with status {status}: {body}").into());
    }
    let CreateJobResponse { job_id } = response.json().await?;
    tracing::info!(job_id = %job_id, "Job created, polling for completion");

    let status_url = format!("{base}/api/jobs/{job_id}");
    let policy = PollPolicy {
        interval: Duration::from_millis(args.interval_ms),
        timeout: Duration::from_secs(args.timeout_secs),
    };

    let job = poll_until_terminal(policy, || {
        let client = client.clone();
        let url = status_url.clone();
        async move {
            client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .json::<Job>()
                .await
        }
    })
    .await?;

    Ok(job)
}

async fn upload(
    client: &reqwest::Client,
    base: &str,
    path: &Path,
) -> Result<UploadResponse, Box<dyn std::error::Error>> {
    let bytes = tokio::fs::read(path).await?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image")
        .to_string();

    let form = multipart::Form::new().part("file", multipart::Part::bytes(bytes).file_name(filename));

    let response = client
        .post(format!("{base}/api/upload"))
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Upload of {} failed with status {}: {}", path.display(), status, error_text).into());
    }

    let body = response.json::<UploadResponse>().await?;
    tracing::info!(image_id = %body.image_id, size = body.size, "Uploaded {}", path.display());
    Ok(body)
}
