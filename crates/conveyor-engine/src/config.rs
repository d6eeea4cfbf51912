//! Machine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors raised while loading a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON for [`MachineConfig`]
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Sizing and timing of a [`Machine`](crate::smachine::Machine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Worker threads (0 = one per CPU)
    pub worker_count: usize,

    /// Maximum live slots (None = unlimited)
    pub max_slots: Option<usize>,

    /// Terminated slot allocations kept for reuse
    pub slot_pool_size: usize,

    /// How long an idle worker sleeps before looking for work again
    pub idle_sleep_micros: u64,

    /// Grace period `shutdown` gives live slots before stopping workers
    pub stop_timeout_millis: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            max_slots: None,
            slot_pool_size: 1024,
            idle_sleep_micros: 100,
            stop_timeout_millis: 1000,
        }
    }
}

impl MachineConfig {
    /// Configuration with a fixed number of workers
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Number of workers to spawn, resolving 0 to the CPU count
    pub fn effective_worker_count(&self) -> usize {
        match self.worker_count {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }
}
