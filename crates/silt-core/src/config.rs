//! silt.toml configuration parser.
//!
//! Every key has a default, so an empty file (or no file at all) yields a
//! usable configuration. Millisecond fields expose `Duration` accessors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global admission budget over the sum of per-worker memory limits
    /// (bytes).
    pub virtual_memory_pool_size: u64,
    pub worker: WorkerDefaults,
    pub control_plane: ControlPlaneConfig,
    pub turf: TurfConfig,
}

/// Per-worker defaults applied when a function profile leaves a field unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerDefaults {
    /// Default per-worker request concurrency.
    pub max_activate_requests: u32,
    /// Per-function replica cap.
    pub replica_count_limit: u32,
    /// Minimum replicas kept after a shrink.
    pub reservation_count: u32,
    /// Consecutive shrink-eligible evaluations before a shrink fires.
    pub shrink_redundant_times: u32,
    /// Victim selection strategy: "LCC", "FIFO" or "FILO".
    pub default_shrink_strategy: String,
    /// Default worker initialization timeout in milliseconds.
    pub default_initializer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Concurrent launches allowed per function.
    pub expand_concurrency: u32,
    /// Inter-start delay for launches that had to queue (milliseconds).
    pub expand_interval_ms: u64,
    /// Reconciler tick period (milliseconds).
    pub reconcile_interval_ms: u64,
    /// Capacity-manager cycle period (milliseconds).
    pub autoscale_interval_ms: u64,
}

/// Settings for the external `turf` sandbox supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurfConfig {
    /// Path to the turf binary.
    pub bin: PathBuf,
    /// Directory holding per-function OCI-style bundles.
    pub bundles_dir: PathBuf,
    /// Directory holding per-worker sandbox log directories.
    pub logs_dir: PathBuf,
    /// Upper bound on a graceful sandbox shutdown (milliseconds).
    pub graceful_exit_period_ms: u64,
    /// Seed process name passed to `turf start`; empty disables seeding.
    pub seed: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            virtual_memory_pool_size: 2 * 1024 * 1024 * 1024,
            worker: WorkerDefaults::default(),
            control_plane: ControlPlaneConfig::default(),
            turf: TurfConfig::default(),
        }
    }
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            max_activate_requests: 10,
            replica_count_limit: 10,
            reservation_count: 0,
            shrink_redundant_times: 60,
            default_shrink_strategy: "LCC".to_string(),
            default_initializer_timeout_ms: 10_000,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            expand_concurrency: 2,
            expand_interval_ms: 300,
            reconcile_interval_ms: 1_000,
            autoscale_interval_ms: 1_000,
        }
    }
}

impl Default for TurfConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("turf"),
            bundles_dir: PathBuf::from("/var/lib/silt/bundles"),
            logs_dir: PathBuf::from("/var/log/silt/workers"),
            graceful_exit_period_ms: 3_000,
            seed: String::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl WorkerDefaults {
    pub fn default_initializer_timeout(&self) -> Duration {
        Duration::from_millis(self.default_initializer_timeout_ms)
    }
}

impl ControlPlaneConfig {
    pub fn expand_interval(&self) -> Duration {
        Duration::from_millis(self.expand_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_millis(self.autoscale_interval_ms)
    }
}

impl TurfConfig {
    pub fn graceful_exit_period(&self) -> Duration {
        Duration::from_millis(self.graceful_exit_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker.max_activate_requests, 10);
        assert_eq!(config.worker.shrink_redundant_times, 60);
        assert_eq!(config.worker.default_shrink_strategy, "LCC");
        assert_eq!(config.control_plane.expand_concurrency, 2);
        assert_eq!(config.turf.graceful_exit_period_ms, 3_000);
    }

    #[test]
    fn parse_empty_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.worker.replica_count_limit, 10);
        assert_eq!(
            config.control_plane.reconcile_interval(),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn parse_partial_overrides() {
        let toml_str = r#"
virtual_memory_pool_size = 1073741824

[worker]
max_activate_requests = 20

[turf]
bin = "/usr/local/bin/turf"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.virtual_memory_pool_size, 1024 * 1024 * 1024);
        assert_eq!(config.worker.max_activate_requests, 20);
        // Untouched sections keep defaults.
        assert_eq!(config.worker.reservation_count, 0);
        assert_eq!(config.turf.bin, PathBuf::from("/usr/local/bin/turf"));
        assert_eq!(config.turf.seed, "");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let s = config.to_toml_string().unwrap();
        let parsed: Config = toml::from_str(&s).unwrap();
        assert_eq!(
            parsed.virtual_memory_pool_size,
            config.virtual_memory_pool_size
        );
        assert_eq!(parsed.worker.shrink_redundant_times, 60);
    }
}
