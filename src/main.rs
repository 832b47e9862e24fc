//! tus Uploadr - Resumable chunked file upload client
//!
//! Uploads one file to a tus 1.0.0 server.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tus_uploadr::config::Config;
use tus_uploadr::upload::LocalFile;
use tus_uploadr::{metrics, telemetry, SessionState, Snapshot, UploadController};

const DEFAULT_ENDPOINT: &str = "http://localhost:8080/tus-files/";

/// tus Uploadr - Resumable chunked uploads over the tus protocol
#[derive(Parser, Debug)]
#[command(name = "tus-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// tus creation endpoint (overrides the configuration file)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// MIME type reported to the server
    #[arg(short, long)]
    mime_type: Option<String>,

    /// How many automatic pauses to resume from before giving up
    #[arg(long, default_value_t = 3)]
    max_resumes: u32,

    /// Delay before resuming after an automatic pause
    #[arg(long, default_value_t = 1000)]
    resume_delay_ms: u64,

    /// Print Prometheus metrics when the session ends
    #[arg(long)]
    print_metrics: bool,

    /// File to upload
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;
    telemetry::init_subscriber(&config.logging)?;

    info!("Starting tus Uploadr v{}", tus_uploadr::VERSION);

    let file = LocalFile::open(&args.file, args.mime_type.as_deref())
        .await
        .with_context(|| format!("Failed to open {}", args.file.display()))?;

    let controller = UploadController::from_config(&config)?;
    let mut updates = controller.subscribe();
    controller.start(Arc::new(file));

    let last = drive(&controller, &mut updates, &args).await;

    if args.print_metrics {
        print!("{}", metrics::gather());
    }

    match last.state {
        SessionState::Succeeded => {
            info!(bytes = last.total_bytes, "Upload complete");
            Ok(())
        }
        state => bail!(
            "Upload {}{}",
            state,
            last.message
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        ),
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let config = match (&args.config, &args.endpoint) {
        (Some(path), endpoint) => {
            let mut config = Config::load(path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))?;
            if let Some(endpoint) = endpoint {
                config.tus.endpoint = endpoint.clone();
            }
            config
        }
        (None, endpoint) => Config::with_endpoint(endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)),
    };
    config.validate()?;
    Ok(config)
}

/// Follow the session until it settles, resuming automatic pauses
async fn drive(
    controller: &UploadController<tus_uploadr::tus::TusClient>,
    updates: &mut watch::Receiver<Snapshot>,
    args: &Args,
) -> Snapshot {
    let mut resumes = 0;
    let mut last_percent = -1.0;

    loop {
        let snapshot = updates.borrow_and_update().clone();

        match snapshot.state {
            SessionState::Uploading if snapshot.progress_percent.floor() > last_percent => {
                last_percent = snapshot.progress_percent.floor();
                info!(
                    file = snapshot.active_file_name.as_deref().unwrap_or_default(),
                    received = snapshot.received_bytes,
                    total = snapshot.total_bytes,
                    "{:.2}%",
                    snapshot.progress_percent
                );
            }
            SessionState::Paused => {
                if resumes >= args.max_resumes {
                    warn!(resumes = resumes, "Giving up after repeated failures");
                    return snapshot;
                }
                resumes += 1;
                warn!(
                    attempt = resumes,
                    reason = snapshot.message.as_deref().unwrap_or_default(),
                    "Upload paused, resuming in {}ms",
                    args.resume_delay_ms
                );

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(args.resume_delay_ms)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted while paused");
                        return controller.snapshot();
                    }
                }

                controller.resume();
                if controller.state() == SessionState::Paused {
                    return controller.snapshot();
                }
                continue;
            }
            SessionState::Succeeded | SessionState::Cancelled | SessionState::Idle => {
                return snapshot;
            }
            SessionState::Uploading => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return controller.snapshot();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, pausing upload");
                controller.pause();
                return controller.snapshot();
            }
        }
    }
}
