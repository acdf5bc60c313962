//! `jobwatch` command-line entry point.
//!
//! ```text
//! jobwatch submit <file> [--text]
//! jobwatch watch <job-id>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_stream::StreamExt;

use jobwatch_auth::{Credential, CredentialStore};
use jobwatch_client::{BinaryPayload, ClientConfig, JobEvent, JobPayload, JobTracker, SubmitOptions};
use jobwatch_core::JobHandle;

const TOKEN_ENV: &str = "JOBWATCH_TOKEN";

#[derive(Debug, Parser)]
#[command(name = "jobwatch", version, about = "Submit backend jobs and follow their progress")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a file as a new job and watch it to completion.
    Submit {
        file: PathBuf,
        /// Send the file contents as a JSON text job instead of an upload.
        #[arg(long)]
        text: bool,
    },
    /// Watch an existing job.
    Watch { id: JobHandle },
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

async fn load_payload(path: &Path, text: bool) -> anyhow::Result<JobPayload> {
    let file = path.display();
    if text {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {file}"))?;
        return Ok(JobPayload::Json(json!({ "text": contents })));
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {file}"))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(JobPayload::Binary(BinaryPayload::new(
        file_name,
        content_type_for(path),
        bytes,
    )))
}

fn print_event(handle: &JobHandle, event: &JobEvent) {
    match event {
        JobEvent::Status(status) => println!(
            "{handle}: {} {}%{}",
            status.state,
            status.progress,
            status
                .message
                .as_deref()
                .map(|m| format!(" ({m})"))
                .unwrap_or_default()
        ),
        JobEvent::Stale {
            status,
            staleness,
            error,
        } => println!(
            "{handle}: {} {}% (stale x{staleness}: {error})",
            status.state, status.progress
        ),
        JobEvent::Lost { reason } => println!("{handle}: lost track of job: {reason}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobwatch_observability::init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env().context("loading configuration")?;

    let credentials = Arc::new(CredentialStore::new());
    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => credentials.set(Credential::from_jwt(token.trim())),
        _ => tracing::warn!("{TOKEN_ENV} not set; sending unauthenticated requests"),
    }

    let tracker = JobTracker::from_config(config, credentials).context("building HTTP client")?;
    tracker.start();

    let handle = match cli.command {
        Command::Submit { file, text } => {
            let payload = load_payload(&file, text).await?;
            let handle = tracker
                .submit_job_with(payload, SubmitOptions::generated())
                .await
                .context("submitting job")?;
            println!("submitted {handle}");
            handle
        }
        Command::Watch { id } => id,
    };

    let mut stream = tracker.observe_job(&handle);
    let mut last = None;
    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(event) => {
                    print_event(&handle, &event);
                    last = Some(event);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; shutting down");
                tracker.shutdown();
                return Ok(());
            }
        }
    }
    tracker.shutdown();

    match last {
        Some(JobEvent::Status(status)) if status.state == jobwatch_core::JobState::Failed => {
            bail!("job {handle} failed")
        }
        Some(JobEvent::Lost { reason }) => bail!("lost track of job {handle}: {reason}"),
        _ => Ok(()),
    }
}
