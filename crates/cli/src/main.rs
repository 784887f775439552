//! CLI entry point for Rendition Ladder
//!
//! Encodes one video file into its rendition ladder and reports the outcome.

use clap::Parser;
use rendition_ladder::{
    new_shared_metrics, run_startup_checks, Config, EncodeOrchestrator, JobOutcome, Upload,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Rendition Ladder - encode a video into a ladder of downscaled renditions
#[derive(Parser, Debug)]
#[command(name = "rendition-ladder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video file to encode
    input: PathBuf,

    /// Job identifier (a random one is generated if omitted)
    #[arg(long)]
    job_id: Option<String>,

    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long)]
    skip_checks: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Respect RUST_LOG if set, otherwise pick a level from --verbose
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if args.verbose {
            "rendition_ladder=debug,rendition_ladder_cli=debug".to_string()
        } else {
            "rendition_ladder=info,rendition_ladder_cli=info".to_string()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let job_id = args
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = match run(&args, &job_id).await {
        Ok(outcome) => outcome,
        Err(message) => {
            tracing::error!(%message, "could not start job");
            failed_outcome(&job_id, message)
        }
    };

    print_outcome(&outcome, args.json);
    if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(args: &Args, job_id: &str) -> Result<JobOutcome, String> {
    let config = Config::load_or_default(&args.config).map_err(|e| e.to_string())?;
    tracing::debug!(config = %args.config.display(), "configuration loaded");

    if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
    } else {
        run_startup_checks(&config).map_err(|e| e.to_string())?;
    }

    let metrics = new_shared_metrics();
    let orchestrator = EncodeOrchestrator::from_config(&config, metrics.clone());

    let stale_after = Duration::from_secs(config.storage.stale_after_secs);
    match orchestrator.staging().sweep_stale(stale_after) {
        Ok(removed) => tracing::debug!(removed, "stale sweep done"),
        Err(e) => tracing::warn!(error = %e, "stale sweep failed"),
    }

    let plan = orchestrator.concurrency_plan();
    tracing::info!(
        cores = plan.total_cores,
        max_concurrent_tiers = plan.max_concurrent_tiers,
        threads_per_encode = plan.threads_per_encode,
        "concurrency plan"
    );

    let upload = Upload::from_path(job_id, &args.input)
        .await
        .map_err(|e| format!("Failed to open {}: {}", args.input.display(), e))?;

    let cancel = spawn_ctrl_c_canceller();
    let outcome = orchestrator.run_with_cancel(upload, cancel).await;

    let snapshot = metrics.read().await;
    tracing::info!(
        completed_jobs = snapshot.completed_jobs,
        failed_jobs = snapshot.failed_jobs,
        renditions_completed = snapshot.renditions_completed,
        renditions_failed = snapshot.renditions_failed,
        total_bytes_encoded = snapshot.total_bytes_encoded,
        "metrics"
    );

    Ok(outcome)
}

/// Token cancelled on the first Ctrl-C
fn spawn_ctrl_c_canceller() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling job");
            trigger.cancel();
        }
    });
    cancel
}

/// Outcome for a job that never reached the orchestrator
fn failed_outcome(job_id: &str, message: String) -> JobOutcome {
    JobOutcome {
        job_id: job_id.to_string(),
        success: false,
        message,
        failure_kind: None,
        completed: Vec::new(),
        failed: Vec::new(),
    }
}

fn print_outcome(outcome: &JobOutcome, json: bool) {
    if json {
        match serde_json::to_string_pretty(outcome) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to serialize outcome: {}", e),
        }
        return;
    }

    println!("Job {}: {}", outcome.job_id, outcome.message);
    for output in &outcome.completed {
        println!(
            "  {:>5}p  {}x{}  {:>12} bytes  {}",
            output.tier_label,
            output.width,
            output.height,
            output.size_bytes,
            output.storage_path.display()
        );
    }
    for failure in &outcome.failed {
        println!("  {:>5}p  FAILED: {}", failure.tier_label, failure.error);
    }
}
