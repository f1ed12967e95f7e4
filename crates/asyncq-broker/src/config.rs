use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Broker configuration, loadable from YAML. Missing fields fall back to
/// the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds between queue depth gauge refreshes.
    pub stats_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            stats_interval_secs: 30,
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
