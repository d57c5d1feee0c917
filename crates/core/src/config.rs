use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DendriteError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Node config ─────────────────────────────────────────────────────

/// Construction parameters for a dendrite node.
///
/// Parsed from the `[node]` section of a TOML file, then overridden by
/// `DENDRITE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Name this node registers under with the broker.
    #[serde(default = "default_name")]
    pub name: String,

    /// Capability type advertised to peers; help queries target nodes of the same type.
    #[serde(default = "default_capability")]
    pub capability: String,

    /// Extra capability tags forwarded in help queries.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Address that receives terminal `task_failed` reports.
    #[serde(default = "default_orchestrator")]
    pub orchestrator: String,

    /// Maximum in-flight executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Queue capacity enforced at admission.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    /// Maximum peers sent a `help_request` per solicitation.
    #[serde(default = "default_max_helpers")]
    pub max_helpers: usize,

    /// Upper bound on the clone count asked of the broker.
    #[serde(default = "default_helper_clone_limit")]
    pub helper_clone_limit: usize,

    /// Base backoff before the first retry; doubles with every further attempt.
    #[serde(default = "default_retry_delay_base_ms")]
    pub retry_delay_base_ms: u64,

    /// Default attempt budget for tasks that do not set their own.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Load sampling interval.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// How long an offloaded task may go unreported before the origin gives up on it.
    #[serde(default = "default_offload_timeout_ms")]
    pub offload_timeout_ms: u64,
}

fn default_name() -> String {
    "dendrite".into()
}
fn default_capability() -> String {
    "dendrite".into()
}
fn default_orchestrator() -> String {
    "orchestrator".into()
}
fn default_max_concurrent() -> usize { 5 }
fn default_max_queue() -> usize { 1000 }
fn default_max_helpers() -> usize { 5 }
fn default_helper_clone_limit() -> usize { 5 }
fn default_retry_delay_base_ms() -> u64 { 500 }
fn default_max_attempts() -> u32 { 3 }
fn default_monitor_interval_ms() -> u64 { 5000 }
fn default_offload_timeout_ms() -> u64 { 300_000 }

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            capability: default_capability(),
            capabilities: Vec::new(),
            orchestrator: default_orchestrator(),
            max_concurrent: default_max_concurrent(),
            max_queue: default_max_queue(),
            max_helpers: default_max_helpers(),
            helper_clone_limit: default_helper_clone_limit(),
            retry_delay_base_ms: default_retry_delay_base_ms(),
            max_attempts: default_max_attempts(),
            monitor_interval_ms: default_monitor_interval_ms(),
            offload_timeout_ms: default_offload_timeout_ms(),
        }
    }
}

impl NodeConfig {
    /// Default config under the given node name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, DendriteError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DendriteError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn offload_timeout(&self) -> Duration {
        Duration::from_millis(self.offload_timeout_ms)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `DENDRITE_<FIELD>` overrides `<field>`, e.g.
    /// `DENDRITE_MAX_CONCURRENT` -> `max_concurrent`. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("DENDRITE_NAME") {
            self.name = v;
        }
        if let Some(v) = env_opt("DENDRITE_CAPABILITY") {
            self.capability = v;
        }
        if let Some(v) = env_opt("DENDRITE_CAPABILITIES") {
            self.capabilities = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env_opt("DENDRITE_ORCHESTRATOR") {
            self.orchestrator = v;
        }
        if let Some(v) = env_parse("DENDRITE_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = env_parse("DENDRITE_MAX_QUEUE") {
            self.max_queue = v;
        }
        if let Some(v) = env_parse("DENDRITE_MAX_HELPERS") {
            self.max_helpers = v;
        }
        if let Some(v) = env_parse("DENDRITE_HELPER_CLONE_LIMIT") {
            self.helper_clone_limit = v;
        }
        if let Some(v) = env_parse("DENDRITE_RETRY_DELAY_BASE_MS") {
            self.retry_delay_base_ms = v;
        }
        if let Some(v) = env_parse("DENDRITE_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse("DENDRITE_MONITOR_INTERVAL_MS") {
            self.monitor_interval_ms = v;
        }
        if let Some(v) = env_parse("DENDRITE_OFFLOAD_TIMEOUT_MS") {
            self.offload_timeout_ms = v;
        }
    }

    /// Reject configs that would leave the node unable to make progress.
    pub fn validate(&self) -> Result<(), DendriteError> {
        if self.name.trim().is_empty() {
            return Err(DendriteError::Config("node name must not be empty".into()));
        }
        if self.capability.trim().is_empty() {
            return Err(DendriteError::Config("capability must not be empty".into()));
        }
        let bounds = [
            ("max_concurrent", self.max_concurrent as u64),
            ("max_queue", self.max_queue as u64),
            ("max_helpers", self.max_helpers as u64),
            ("helper_clone_limit", self.helper_clone_limit as u64),
            ("max_attempts", self.max_attempts as u64),
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("offload_timeout_ms", self.offload_timeout_ms),
        ];
        for (field, value) in bounds {
            if value == 0 {
                return Err(DendriteError::Config(format!("{field} must be greater than 0")));
            }
        }
        Ok(())
    }
}
