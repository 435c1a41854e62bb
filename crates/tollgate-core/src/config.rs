//! tollgate.toml configuration parser.
//!
//! Every field is optional in the file; defaults are chosen so that a proxy
//! with no config file at all still enforces sane limits.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level TollGate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TollgateConfig {
    pub limiter: LimiterConfig,
    pub fleet: FleetConfig,
    pub abuse: AbuseConfig,
    pub sizes: SizeLimitsConfig,
    pub cost: CostConfig,
}

/// Token-bucket tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Burst ceiling as a multiple of the per-second capacity.
    pub burst_multiplier: f64,
    /// Default bounded wait before a denial is surfaced, in milliseconds.
    pub default_max_wait_ms: u64,
    /// Limiter entries idle longer than this are garbage-collected.
    pub idle_gc_secs: u64,
    /// Default for the per-request "prefer throttling exceptions" toggle.
    pub prefer_throttling_errors: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            burst_multiplier: 2.0,
            default_max_wait_ms: 50,
            idle_gc_secs: 600,
            prefer_throttling_errors: false,
        }
    }
}

/// Fleet reconciliation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Interval between reconciliation rounds, in milliseconds.
    pub reconcile_interval_ms: u64,
    /// Minimum share of the global capacity any live instance keeps,
    /// as a fraction (so a newly-joined instance is never starved to zero).
    pub min_share_fraction: f64,
    /// Instances silent longer than this are considered gone.
    pub instance_stale_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 5_000,
            min_share_fraction: 0.05,
            instance_stale_secs: 30,
        }
    }
}

/// Abuse-penalty tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Errors from a fresh client that are never penalized.
    pub grace_errors: u32,
    /// Sliding window over which per-client errors are counted.
    pub window_secs: u64,
    /// Window error count that moves a client to Elevated.
    pub elevate_threshold: u32,
    /// Window error count that moves a client to Throttled.
    pub throttle_threshold: u32,
    /// Delay applied to erroring responses while Elevated, in milliseconds.
    pub elevated_delay_ms: u64,
    /// Delay applied while Throttled; sized near the request timeout so
    /// flooding clients observe timeouts instead of fast errors.
    pub throttled_delay_ms: u64,
    /// Quiet period with no errors after which a client resets to Normal.
    pub cooldown_secs: u64,
    /// Maximum number of client identities tracked at once.
    pub max_tracked_clients: usize,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            grace_errors: 5,
            window_secs: 60,
            elevate_threshold: 5,
            throttle_threshold: 15,
            elevated_delay_ms: 250,
            throttled_delay_ms: 5_000,
            cooldown_secs: 120,
            max_tracked_clients: 10_000,
        }
    }
}

/// Request shape limits; violations are non-retryable user errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeLimitsConfig {
    pub max_request_bytes: u64,
    pub max_row_bytes: u64,
    pub max_key_bytes: u64,
    pub max_batch_operations: u32,
}

impl Default for SizeLimitsConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 2 * 1024 * 1024,
            max_row_bytes: 512 * 1024,
            max_key_bytes: 64,
            max_batch_operations: 50,
        }
    }
}

/// Cost-accounting tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Charging granularity in bytes; partial blocks round up.
    pub block_bytes: u64,
    /// Multiplier applied to absolute-consistency reads.
    pub absolute_read_multiplier: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            block_bytes: 1024,
            absolute_read_multiplier: 2,
        }
    }
}

impl TollgateConfig {
    /// Load configuration from a tollgate.toml file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TollgateConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reconciliation interval as a `Duration`.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.fleet.reconcile_interval_ms)
    }
}
