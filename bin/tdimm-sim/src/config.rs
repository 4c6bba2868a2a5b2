//! Configuration file of the simulator
//!
//! ```toml
//! [engine]
//! token_count = 128
//! sec_copies = 2
//!
//! [sim]
//! capacity_mb = 64
//! latency_polls = 2
//!
//! [raid]
//! level = "stripe"
//! stride_sectors = 64
//!
//! [workload]
//! requests = 10000
//! ```

use serde::Deserialize;
use std::path::Path;
use tdimm_common::{EngineConfig, RaidConfig};
use tdimm_engine::SimConfig;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sim: SimSection,
    /// Build a RAID set over the engines when present
    #[serde(default)]
    pub raid: Option<RaidConfig>,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load `path`, or defaults when it does not exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }
}

/// Simulated device parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimSection {
    pub engines: usize,
    pub capacity_mb: u64,
    pub latency_polls: u32,
    pub ext_delay_polls: u32,
    pub strict_sequence: bool,
    /// Retryable faults injected per engine at random points
    pub faults: u32,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            engines: 2,
            capacity_mb: 64,
            latency_polls: 1,
            ext_delay_polls: 0,
            strict_sequence: false,
            faults: 0,
        }
    }
}

impl SimSection {
    #[must_use]
    pub fn sim_config(&self, name: &str, engine: &EngineConfig) -> SimConfig {
        SimConfig {
            name: name.to_string(),
            capacity_bytes: self.capacity_mb << 20,
            max_request_bytes: engine.max_request_bytes,
            write_buffers: engine.write_buffers,
            read_buffers: engine.read_buffers,
            latency_polls: self.latency_polls,
            ext_delay_polls: self.ext_delay_polls,
            strict_sequence: self.strict_sequence,
            ..SimConfig::default()
        }
    }
}

/// Synthetic workload shape
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub requests: u64,
    /// Requests in flight per batch
    pub queue_depth: usize,
    /// Largest request in sectors
    pub max_sectors: u64,
    pub read_percent: u32,
    pub discard_percent: u32,
    pub seed: Option<u64>,
    pub workers: usize,
    pub poll_interval_us: u64,
    pub timeout_secs: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            requests: 2000,
            queue_depth: 32,
            max_sectors: 64,
            read_percent: 50,
            discard_percent: 5,
            seed: None,
            workers: 2,
            poll_interval_us: 200,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
