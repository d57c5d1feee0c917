//! Worker settings file: a `[node]` and a `[mesh]` table.
//!
//! ```toml
//! [node]
//! name = "scraper-1"
//! capability = "scraper"
//! max_concurrent = 4
//!
//! [mesh]
//! help_query_timeout_ms = 800
//!
//! [mesh.broker]
//! frontend = "tcp://10.0.0.5:5555"
//! backend = "tcp://10.0.0.5:5556"
//! health = "tcp://10.0.0.5:5557"
//! ```

use std::path::Path;

use anyhow::Context;
use dendrite_core::NodeConfig;
use dendrite_eisenbahn::MeshConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl WorkerSettings {
    /// Read the file if given, otherwise start from defaults, then apply
    /// `DENDRITE_*` and `EISENBAHN_*` overrides. Validation is left to the
    /// caller so CLI flags can still adjust the result.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("invalid settings {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.node.apply_env_overrides();
        settings.mesh.apply_env_overrides();
        Ok(settings)
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.node.validate()?;
        self.mesh.validate()?;
        Ok(())
    }
}
