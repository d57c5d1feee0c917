//! dendrite-worker: runs one dendrite node on the mesh.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: IPC broker under /tmp/dendrite, node "dendrite"
//! dendrite-worker --name scraper-1 --capability scraper
//!
//! # Settings file with [node] and [mesh] sections, plus a task seed
//! dendrite-worker --config dendrite.toml --seed tasks.jsonl
//! ```

mod processor;
mod seed;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use dendrite_core::{AddTaskOutcome, Dendrite, DendriteHandle, NodeEvent};
use dendrite_eisenbahn::ZmqMesh;

use crate::processor::EchoProcessor;
use crate::settings::WorkerSettings;

/// Run a dendrite worker node.
#[derive(Parser, Debug)]
#[command(name = "dendrite-worker", version, about)]
struct Cli {
    /// Settings file with `[node]` and `[mesh]` tables.
    #[arg(long, env = "DENDRITE_CONFIG")]
    config: Option<PathBuf>,

    /// Node name; overrides the settings file.
    #[arg(long)]
    name: Option<String>,

    /// Capability type peers find this node by; overrides the settings file.
    #[arg(long)]
    capability: Option<String>,

    /// JSON-lines file of tasks to enqueue at startup.
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Seconds between status log lines (0 = disabled).
    #[arg(long, env = "DENDRITE_STATUS_INTERVAL", default_value_t = 30)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dendrite_core::config::load_dotenv();
    let cli = Cli::parse();

    let mut settings = WorkerSettings::load(cli.config.as_deref())?;
    if let Some(name) = &cli.name {
        settings.node.name = name.clone();
    }
    if let Some(capability) = &cli.capability {
        settings.node.capability = capability.clone();
    }
    settings.validate()?;

    info!(
        node = %settings.node.name,
        capability = %settings.node.capability,
        broker = %settings.mesh.broker.frontend,
        "starting dendrite-worker"
    );

    let mesh = Arc::new(ZmqMesh::connect(&settings.mesh).await?);
    let node = Dendrite::builder(settings.node.clone())
        .processor(Arc::new(EchoProcessor))
        .broker(mesh.clone())
        .spawn()
        .await?;

    tokio::spawn(log_events(node.subscribe_events()));

    if let Some(path) = &cli.seed {
        seed_tasks(&node, path).await?;
    }

    if cli.status_interval > 0 {
        let node = node.clone();
        let period = Duration::from_secs(cli.status_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                log_status(&node).await;
            }
        });
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    node.shutdown().await?;
    log_status(&node).await;
    mesh.close().await;

    info!("dendrite-worker exited cleanly");
    Ok(())
}

async fn seed_tasks(node: &DendriteHandle, path: &std::path::Path) -> anyhow::Result<()> {
    let tasks = seed::load(path)?;
    let total = tasks.len();
    let mut accepted = 0;
    for task in tasks {
        match node.add_task(task.payload, task.options).await? {
            AddTaskOutcome::Accepted { .. } => accepted += 1,
            AddTaskOutcome::Rejected { reason } => {
                warn!(reason = %reason, "seed task rejected");
            }
        }
    }
    info!(path = %path.display(), accepted, total, "seeded tasks");
    Ok(())
}

async fn log_status(node: &DendriteHandle) {
    match node.status().await {
        Ok(status) => info!(
            node = %status.id,
            phase = ?status.phase,
            queue = status.state.queue_size,
            processing = status.state.processing,
            helpers = ?status.state.helpers,
            processed = status.state.total_processed,
            errors = status.state.total_errors,
            load = status.load.overall,
            "node status"
        ),
        Err(e) => warn!(error = %e, "status unavailable"),
    }
}

async fn log_events(mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(NodeEvent::TaskCompleted { task_id, .. }) => {
                info!(task_id = %task_id, "task completed");
            }
            Ok(NodeEvent::TaskRetrying {
                task_id,
                attempts,
                delay,
            }) => {
                warn!(task_id = %task_id, attempts, delay_ms = delay.as_millis() as u64, "task retrying");
            }
            Ok(NodeEvent::TaskFailed {
                task_id,
                error,
                attempts,
            }) => {
                error!(task_id = %task_id, attempts, error = %error, "task failed");
            }
            Ok(NodeEvent::HelpersChanged { helpers }) => {
                info!(helpers = ?helpers, "helpers changed");
            }
            Ok(NodeEvent::PeerTaskFailed {
                task_id,
                error,
                from,
            }) => {
                warn!(task_id = %task_id, from = %from, error = %error, "offloaded task failed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
