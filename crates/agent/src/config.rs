use std::path::Path;

use anyhow::{Context, Result};
use dpsync_reconcile::CascadePolicy;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime knobs for the agent and its change loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Capacity of the change-event channel and the coalescing queue.
    pub queue_cap: usize,
    /// Batching interval of the change loop.
    pub tick_ms: u64,
    pub cascade: CascadePolicy,
}

impl Default for AgentConfig {
    fn default() -> Self { Self { queue_cap: 1024, tick_ms: 20, cascade: CascadePolicy::Drop } }
}

impl AgentConfig {
    /// Defaults overridden by `DPSYNC_QUEUE_CAP`, `DPSYNC_TICK_MS` and `DPSYNC_CASCADE`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = std::env::var("DPSYNC_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()) {
            cfg.queue_cap = v.max(1);
        }
        if let Some(v) = std::env::var("DPSYNC_TICK_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.tick_ms = v.max(1);
        }
        if let Ok(s) = std::env::var("DPSYNC_CASCADE") {
            match s.parse::<CascadePolicy>() {
                Ok(p) => cfg.cascade = p,
                Err(e) => warn!(error = %e, "ignoring DPSYNC_CASCADE"),
            }
        }
        cfg
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> { serde_yaml::from_str(s).context("parsing agent config") }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&s)
    }
}
