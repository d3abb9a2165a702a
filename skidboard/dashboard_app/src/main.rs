use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use shared_event_bus::{EventPublisher, FileEventPublisher};
use shared_logging::LogLevel;
use skidboard_sync::{
    ButtonEdge, EdgePolarity, InterlockOutcome, MemoryTagSource, SkidConfig, SkidRuntime,
    SnapshotBroadcaster, SubscriptionHandle, SyncTelemetry, ValveInterlock,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skidboard", version, about = "Skid supervisory dashboard core")]
struct Cli {
    /// Site configuration (TOML).
    #[arg(long)]
    config: PathBuf,
    /// JSON seed for the in-memory tag store.
    #[arg(long)]
    tags: Option<PathBuf>,
    /// Writes every display event to this JSON-lines file.
    #[arg(long)]
    event_log: Option<PathBuf>,
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    log_level: Verbosity,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Verbosity {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Verbosity> for LogLevel {
    fn from(value: Verbosity) -> Self {
        match value {
            Verbosity::Debug => Self::Debug,
            Verbosity::Info => Self::Info,
            Verbosity::Warn => Self::Warn,
            Verbosity::Error => Self::Error,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = SkidConfig::load(&cli.config)?;
    let site = config.site.name.clone();
    let tags = match &cli.tags {
        Some(path) => MemoryTagSource::from_json_file(path)?,
        None => MemoryTagSource::new(),
    };
    let telemetry = build_telemetry(&site, &cli.log_dir, cli.log_level.into())?;

    let runtime = SkidRuntime::builder()
        .config(config)
        .tags(Arc::new(tags))
        .telemetry(telemetry)
        .build()?;

    let event_log = match &cli.event_log {
        Some(path) => Some(spawn_event_log(runtime.subscribe(), path, site.clone())?),
        None => None,
    };
    let running = runtime.start().await;
    info!(site = %site, "skid dashboard core running; type start, stop or status");

    let console = tokio::spawn(console(runtime.interlock(), runtime.broadcaster()));
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");

    console.abort();
    running.shutdown().await?;
    if let Some(task) = event_log {
        task.abort();
    }
    Ok(())
}

fn build_telemetry(site: &str, log_dir: &Path, level: LogLevel) -> Result<SyncTelemetry> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let publisher = FileEventPublisher::new(log_dir.join("events.jsonl"))?;
    SyncTelemetry::builder(site)
        .log_path(log_dir.join("skid.jsonl"))
        .min_level(level)
        .event_publisher(Arc::new(publisher))
        .build()
}

/// Viewer that appends every display event to a JSON-lines file.
fn spawn_event_log(
    mut subscription: SubscriptionHandle,
    path: &Path,
    site: String,
) -> Result<JoinHandle<()>> {
    let publisher = FileEventPublisher::new(path)?;
    info!(path = %path.display(), id = %subscription.id(), "event log viewer attached");
    Ok(tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if let Err(err) = publisher.publish(event.to_record(&site)).await {
                warn!(error = %err, "event log write failed");
            }
        }
        warn!("event log viewer dropped by broadcaster");
    }))
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Start,
    Stop,
    Status,
}

fn parse_command(line: &str) -> Option<ConsoleCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "start" | "open" => Some(ConsoleCommand::Start),
        "stop" | "close" => Some(ConsoleCommand::Stop),
        "status" => Some(ConsoleCommand::Status),
        _ => None,
    }
}

/// Turns console lines into button edges, standing in for the pulse listener.
async fn console(
    interlock: Arc<ValveInterlock>,
    broadcaster: Arc<SnapshotBroadcaster>,
) {
    let pins = interlock.pins();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut counter = 0_u64;
    let mut last_edge = Instant::now();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "console read failed");
                break;
            }
        };
        let pin = match parse_command(&line) {
            Some(ConsoleCommand::Start) => pins.start_button,
            Some(ConsoleCommand::Stop) => pins.stop_button,
            Some(ConsoleCommand::Status) => {
                let snapshot = broadcaster.latest();
                println!(
                    "{}",
                    json!({ "health": broadcaster.health(), "snapshot": snapshot.as_ref() })
                );
                continue;
            }
            None => {
                if !line.trim().is_empty() {
                    warn!(line = %line.trim(), "unknown console command");
                }
                continue;
            }
        };
        counter += 1;
        let edge = ButtonEdge {
            pin,
            value: true,
            elapsed: last_edge.elapsed(),
            counter,
            polarity: EdgePolarity::Rising,
        };
        last_edge = Instant::now();
        match interlock.handle_edge(edge).await {
            InterlockOutcome::NotAuthorized(selector) => {
                info!(selector = %selector, "button ignored: manual valve control not selected");
            }
            InterlockOutcome::Advisory(advisory) => warn!(message = %advisory.message, "interlock"),
            InterlockOutcome::Actuated { command, confirmed } => {
                info!(command = %command, ?confirmed, "valve actuated");
            }
            InterlockOutcome::Failed { command, error } => {
                warn!(command = %command, error = %error, "valve command failed");
            }
            InterlockOutcome::Ignored(_) => {}
        }
    }
}
