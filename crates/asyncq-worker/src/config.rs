use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use asyncq_core::DEFAULT_QUEUE;

/// Largest admissible concurrency: the biggest prefetch window the wire
/// protocol can express (matching AMQP 0-9-1's maximum prefetch count).
pub const MAX_CONCURRENCY: u16 = u16::MAX;

/// Concurrency used when neither flag nor config file names one.
pub const DEFAULT_CONCURRENCY: u16 = 10_000;

/// Worker configuration, loadable from YAML. Missing fields fall back to
/// the defaults below; command-line flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker_addr: String,
    /// Result store address; `None` disables result writes entirely.
    pub result_backend_addr: Option<String>,
    pub queues: Vec<String>,
    pub concurrency: u16,
    /// Per-queue prefetch window; defaults to `concurrency`.
    pub prefetch: Option<u16>,
    /// Stable worker name; generated from the hostname when absent.
    pub worker_name: Option<String>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// How long shutdown waits for in-flight tasks before giving up.
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:5672".to_string(),
            result_backend_addr: None,
            queues: vec![DEFAULT_QUEUE.to_string()],
            concurrency: DEFAULT_CONCURRENCY,
            prefetch: None,
            worker_name: None,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn effective_prefetch(&self) -> u16 {
        self.prefetch.unwrap_or(self.concurrency).max(1)
    }

    /// The configured worker name, or a generated `worker@host-xxxxxxxx`.
    pub fn node_name(&self) -> String {
        match &self.worker_name {
            Some(name) => name.clone(),
            None => generate_node_name(),
        }
    }
}

fn generate_node_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let id = Uuid::new_v4().simple().to_string();
    format!("worker@{host}-{}", &id[..8])
}

/// Validate a requested concurrency level before anything connects.
pub fn validate_concurrency(value: i64) -> Result<u16, String> {
    if value >= 1 && value <= MAX_CONCURRENCY as i64 {
        Ok(value as u16)
    } else {
        Err(format!(
            "concurrency must be between 1 and {MAX_CONCURRENCY} \
             (the maximum AMQP 0-9-1 prefetch count)"
        ))
    }
}
