//! Scheduler and driver configuration
//!
//! Both structures deserialize from camelCase JSON with every field optional,
//! so a config file only needs to name what it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default number of in-flight chunks per peer
pub const DEFAULT_MAX_CONCURRENT_PER_PEER: u32 = 3;

/// Default chunk request timeout in milliseconds (30 seconds)
pub const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 30_000;

/// Weight of a new response-time sample in the moving average
pub const DEFAULT_RESPONSE_TIME_WEIGHT: f64 = 0.3;

/// Default driver tick in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Default number of requests asked for per tick
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// How long the driver tolerates "no peers, nothing in flight" (60 seconds)
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 60_000;

// ============================================================================
// Scheduler Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Concurrency budget for peers enrolled without an explicit one
    pub default_max_concurrent: u32,
    /// Timeout stamped on every new request
    pub chunk_timeout_ms: u64,
    /// EMA weight for response-time samples (0.0 to 1.0)
    pub response_time_weight: f64,
    /// Reject outcome reports for chunks that are already received
    pub strict_outcomes: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: DEFAULT_MAX_CONCURRENT_PER_PEER,
            chunk_timeout_ms: DEFAULT_CHUNK_TIMEOUT_MS,
            response_time_weight: DEFAULT_RESPONSE_TIME_WEIGHT,
            strict_outcomes: false,
        }
    }
}

impl SchedulerConfig {
    /// Peers on the local network: deep pipelines, short timeouts
    pub fn for_lan() -> Self {
        Self {
            default_max_concurrent: 8,
            chunk_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    /// Peers reached through a relay: shallow pipelines, generous timeouts
    pub fn for_relayed() -> Self {
        Self {
            default_max_concurrent: 2,
            chunk_timeout_ms: 60_000,
            ..Default::default()
        }
    }

    /// Clamp values that would stall or destabilize the scheduler
    pub fn normalized(mut self) -> Self {
        if self.default_max_concurrent == 0 {
            self.default_max_concurrent = 1;
        }
        if !self.response_time_weight.is_finite() {
            self.response_time_weight = DEFAULT_RESPONSE_TIME_WEIGHT;
        }
        self.response_time_weight = self.response_time_weight.clamp(0.0, 1.0);
        self
    }
}

// ============================================================================
// Driver Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    /// Interval between scheduler polls
    pub poll_interval_ms: u64,
    /// Maximum requests produced per poll
    pub batch_size: usize,
    /// Give up once no peer is available and nothing is in flight for this long
    pub stall_timeout_ms: u64,
    /// Evict a peer once its failure count reaches this value
    pub max_peer_failures: Option<u32>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            max_peer_failures: None,
        }
    }
}

/// On-disk configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SwarmConfig {
    pub scheduler: SchedulerConfig,
    pub driver: DriverConfig,
}

/// Load a JSON configuration file
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SwarmConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(SwarmConfig {
        scheduler: config.scheduler.normalized(),
        driver: config.driver,
    })
}
