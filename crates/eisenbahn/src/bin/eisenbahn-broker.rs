//! eisenbahn-broker: central PUB/SUB proxy for dendrite nodes.
//!
//! Forwards everything published on the frontend to subscribers on the
//! backend and answers liveness probes on a REP socket.
//!
//! # Usage
//!
//! ```bash
//! # Local IPC under /tmp/dendrite (default)
//! eisenbahn-broker
//!
//! # TCP: frontend on 5555, backend on 5556, health on 5557
//! eisenbahn-broker --transport tcp --host 0.0.0.0 --base-port 5555
//!
//! # Same endpoints as the workers' [mesh] section
//! eisenbahn-broker --config dendrite.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dendrite_eisenbahn::{BrokerConfig, EventBroker, MeshConfig, Transport};

/// Central PUB/SUB proxy for the dendrite mesh.
#[derive(Parser, Debug)]
#[command(name = "eisenbahn-broker", version, about)]
struct Cli {
    /// TOML file with a `[mesh]` section; overrides the transport flags.
    #[arg(long, env = "EISENBAHN_CONFIG")]
    config: Option<PathBuf>,

    /// Transport type: "ipc" or "tcp".
    #[arg(long, env = "EISENBAHN_TRANSPORT", default_value = "ipc")]
    transport: String,

    /// TCP host to bind (tcp only).
    #[arg(long, env = "EISENBAHN_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Frontend port; backend and health take the next two (tcp only).
    #[arg(long, env = "EISENBAHN_BASE_PORT", default_value_t = 5555)]
    base_port: u16,

    /// IPC socket name prefix (ipc only).
    #[arg(long, env = "EISENBAHN_IPC_PREFIX", default_value = "broker")]
    ipc_prefix: String,

    /// Seconds between metrics log lines (0 = disabled).
    #[arg(long, env = "EISENBAHN_METRICS_INTERVAL", default_value_t = 30)]
    metrics_interval: u64,
}

/// The `[mesh]` table of a worker settings file.
#[derive(serde::Deserialize)]
struct SettingsFile {
    #[serde(default)]
    mesh: MeshConfig,
}

impl Cli {
    fn broker_config(&self) -> anyhow::Result<BrokerConfig> {
        if let Some(path) = &self.config {
            let content = std::fs::read_to_string(path)?;
            let mut mesh = toml::from_str::<SettingsFile>(&content)?.mesh;
            mesh.apply_env_overrides();
            mesh.validate()?;
            return Ok(BrokerConfig::from_mesh(&mesh)?);
        }
        Ok(match self.transport.as_str() {
            "tcp" => BrokerConfig::from_mesh(&MeshConfig::tcp(&self.host, self.base_port))?,
            "ipc" => BrokerConfig {
                frontend: Transport::ipc(&format!("{}-frontend", self.ipc_prefix)),
                backend: Transport::ipc(&format!("{}-backend", self.ipc_prefix)),
                health: Transport::ipc(&format!("{}-health", self.ipc_prefix)),
            },
            other => anyhow::bail!("unknown transport '{other}', expected ipc or tcp"),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting eisenbahn-broker");

    let config = cli.broker_config()?;
    let broker = Arc::new(EventBroker::new(config));

    let broker_for_signal = broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        broker_for_signal.shutdown();
    });

    if cli.metrics_interval > 0 {
        let metrics = broker.metrics().clone();
        let period = Duration::from_secs(cli.metrics_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let counts = metrics.topic_counts.lock().await;
                tracing::info!(
                    total_messages = metrics.total(),
                    unique_topics = counts.len(),
                    "broker metrics"
                );
                for (topic, count) in counts.iter() {
                    tracing::debug!(topic = %topic, count = count, "topic stats");
                }
            }
        });
    }

    broker.run().await?;

    tracing::info!("eisenbahn-broker exited cleanly");
    Ok(())
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
