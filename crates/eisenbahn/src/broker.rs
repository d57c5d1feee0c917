use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use zeromq::prelude::*;
use zeromq::{PubSocket, RepSocket, SubSocket, ZmqMessage};

use crate::config::MeshConfig;
use crate::error::EisenbahnError;
use crate::transport::Transport;

/// Message counts kept while proxying.
#[derive(Debug)]
pub struct BrokerMetrics {
    pub total_messages: AtomicU64,
    pub topic_counts: Mutex<HashMap<String, u64>>,
}

impl BrokerMetrics {
    fn new() -> Self {
        Self {
            total_messages: AtomicU64::new(0),
            topic_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn total(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    /// Count for one exact topic.
    pub async fn topic_count(&self, topic: &str) -> u64 {
        self.topic_counts.lock().await.get(topic).copied().unwrap_or(0)
    }

    async fn record(&self, topic: &str) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        *self
            .topic_counts
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert(0) += 1;
    }
}

/// Sockets the broker binds.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Publishers connect here (broker binds SUB).
    pub frontend: Transport,
    /// Subscribers connect here (broker binds PUB).
    pub backend: Transport,
    /// REP socket for liveness probes.
    pub health: Transport,
}

impl BrokerConfig {
    pub fn local() -> Self {
        Self {
            frontend: Transport::ipc("broker-frontend"),
            backend: Transport::ipc("broker-backend"),
            health: Transport::ipc("broker-health"),
        }
    }

    pub fn tcp(host: &str, frontend_port: u16, backend_port: u16, health_port: u16) -> Self {
        Self {
            frontend: Transport::tcp(host, frontend_port),
            backend: Transport::tcp(host, backend_port),
            health: Transport::tcp(host, health_port),
        }
    }

    /// Bind the endpoints the mesh's nodes will connect to.
    pub fn from_mesh(mesh: &MeshConfig) -> Result<Self, EisenbahnError> {
        Ok(Self {
            frontend: mesh.frontend_transport()?,
            backend: mesh.backend_transport()?,
            health: mesh.health_transport()?,
        })
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::local()
    }
}

/// Central PUB/SUB proxy.
///
/// Publishers connect to the frontend, subscribers to the backend; every
/// message received on the frontend is forwarded unchanged to the backend.
/// `zeromq` 0.4 has no XPUB/XSUB, so the frontend is a SUB socket
/// subscribed to everything.
pub struct EventBroker {
    config: BrokerConfig,
    metrics: Arc<BrokerMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl EventBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(BrokerMetrics::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    /// Ask `run` to return. Takes effect within one poll interval.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Bind all three sockets and proxy until [`EventBroker::shutdown`].
    pub async fn run(&self) -> Result<(), EisenbahnError> {
        for transport in [&self.config.frontend, &self.config.backend, &self.config.health] {
            transport.ensure_ipc_dir()?;
            transport.remove_stale_socket()?;
        }

        let mut frontend = SubSocket::new();
        frontend.bind(&self.config.frontend.endpoint()).await?;
        frontend.subscribe("").await?;
        tracing::info!(endpoint = %self.config.frontend, "broker frontend (SUB) bound");

        let mut backend = PubSocket::new();
        backend.bind(&self.config.backend.endpoint()).await?;
        tracing::info!(endpoint = %self.config.backend, "broker backend (PUB) bound");

        let mut health = RepSocket::new();
        health.bind(&self.config.health.endpoint()).await?;
        tracing::info!(endpoint = %self.config.health, "broker health check (REP) bound");

        let shutdown_flag = self.shutdown.clone();
        let health_task = tokio::spawn(async move {
            Self::health_loop(&mut health, &shutdown_flag).await;
        });

        tracing::info!("broker proxy loop started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let msg = match tokio::time::timeout(Duration::from_millis(100), frontend.recv()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "frontend recv error");
                    continue;
                }
                Err(_) => continue,
            };

            let topic = extract_topic(&msg);
            self.metrics.record(&topic).await;
            tracing::debug!(topic = %topic, total = self.metrics.total(), "forwarding message");

            if let Err(e) = backend.send(msg).await {
                tracing::warn!(error = %e, "backend send error");
            }
        }

        let _ = health_task.await;
        tracing::info!(total = self.metrics.total(), "broker stopped");
        Ok(())
    }

    /// Reply "ok" to every request until shutdown.
    async fn health_loop(health: &mut RepSocket, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            match tokio::time::timeout(Duration::from_millis(500), health.recv()).await {
                Ok(Ok(_request)) => {
                    let reply: ZmqMessage = "ok".into();
                    if let Err(e) = health.send(reply).await {
                        tracing::warn!(error = %e, "health reply error");
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "health recv error"),
                Err(_) => {}
            }
        }
    }
}

/// First frame as UTF-8, lossily.
fn extract_topic(msg: &ZmqMessage) -> String {
    msg.iter()
        .next()
        .map(|frame| String::from_utf8_lossy(frame.as_ref()).into_owned())
        .unwrap_or_else(|| "<empty>".to_string())
}
