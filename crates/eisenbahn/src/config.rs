use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EisenbahnError;
use crate::transport::{Transport, IPC_DIR};

// ── Mesh config ─────────────────────────────────────────────────────

/// Connection settings for a node process joining the mesh.
///
/// Parsed from the `[mesh]` section of a TOML file, with `EISENBAHN_*`
/// environment variable overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshConfig {
    #[serde(default)]
    pub broker: BrokerEndpoints,

    /// How long `request_help` waits for peers to answer.
    #[serde(default = "default_help_query_timeout_ms")]
    pub help_query_timeout_ms: u64,
}

/// Where the central broker listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerEndpoints {
    /// Publishers connect here (broker SUB socket).
    #[serde(default = "default_broker_frontend")]
    pub frontend: String,

    /// Subscribers connect here (broker PUB socket).
    #[serde(default = "default_broker_backend")]
    pub backend: String,

    /// REP socket answering liveness probes with "ok".
    #[serde(default = "default_broker_health")]
    pub health: String,
}

fn default_broker_frontend() -> String {
    format!("ipc://{IPC_DIR}/broker-frontend.sock")
}

fn default_broker_backend() -> String {
    format!("ipc://{IPC_DIR}/broker-backend.sock")
}

fn default_broker_health() -> String {
    format!("ipc://{IPC_DIR}/broker-health.sock")
}

fn default_help_query_timeout_ms() -> u64 {
    500
}

impl Default for BrokerEndpoints {
    fn default() -> Self {
        Self {
            frontend: default_broker_frontend(),
            backend: default_broker_backend(),
            health: default_broker_health(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::local()
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl MeshConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, EisenbahnError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EisenbahnError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Single-host mesh over IPC sockets under [`IPC_DIR`].
    pub fn local() -> Self {
        Self {
            broker: BrokerEndpoints::default(),
            help_query_timeout_ms: default_help_query_timeout_ms(),
        }
    }

    /// Mesh over TCP: frontend on `base_port`, backend on `+1`, health on `+2`.
    pub fn tcp(host: &str, base_port: u16) -> Self {
        Self {
            broker: BrokerEndpoints {
                frontend: format!("tcp://{host}:{base_port}"),
                backend: format!("tcp://{host}:{}", base_port + 1),
                health: format!("tcp://{host}:{}", base_port + 2),
            },
            help_query_timeout_ms: default_help_query_timeout_ms(),
        }
    }

    pub fn frontend_transport(&self) -> Result<Transport, EisenbahnError> {
        self.broker.frontend.parse()
    }

    pub fn backend_transport(&self) -> Result<Transport, EisenbahnError> {
        self.broker.backend.parse()
    }

    pub fn health_transport(&self) -> Result<Transport, EisenbahnError> {
        self.broker.health.parse()
    }

    pub fn help_query_timeout(&self) -> Duration {
        Duration::from_millis(self.help_query_timeout_ms)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `EISENBAHN_BROKER_FRONTEND` → `broker.frontend`
    /// - `EISENBAHN_BROKER_BACKEND` → `broker.backend`
    /// - `EISENBAHN_BROKER_HEALTH` → `broker.health`
    /// - `EISENBAHN_HELP_QUERY_TIMEOUT_MS` → `help_query_timeout_ms`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("EISENBAHN_BROKER_FRONTEND") {
            self.broker.frontend = v;
        }
        if let Some(v) = lookup("EISENBAHN_BROKER_BACKEND") {
            self.broker.backend = v;
        }
        if let Some(v) = lookup("EISENBAHN_BROKER_HEALTH") {
            self.broker.health = v;
        }
        if let Some(ms) = lookup("EISENBAHN_HELP_QUERY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.help_query_timeout_ms = ms;
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Every endpoint must parse and the help timeout must be non-zero.
    pub fn validate(&self) -> Result<(), EisenbahnError> {
        self.frontend_transport()?;
        self.backend_transport()?;
        self.health_transport()?;
        if self.broker.frontend == self.broker.backend {
            return Err(EisenbahnError::Config(format!(
                "broker frontend and backend must differ (both '{}')",
                self.broker.frontend
            )));
        }
        if self.help_query_timeout_ms == 0 {
            return Err(EisenbahnError::Config(
                "help_query_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
