//! Configuration constants for the control plane
//!
//! Centralizes all tunables with environment-variable overrides so
//! deployments can adjust probing and recovery behavior without code
//! changes.

use std::env;
use std::time::Duration;

/// Parse an environment variable as a typed value with a default fallback
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Health probing configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Interval between probe cycles in milliseconds
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds; overruns count as failures
    pub timeout_ms: u64,
    /// Consecutive failures in Suspect before declaring Down
    pub failure_threshold: u32,
    /// Consecutive successes before leaving Suspect upward
    pub success_threshold: u32,
    /// Rolling latency window size per element
    pub latency_window: usize,
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: env_var_or_default("FABRIC_PROBE_INTERVAL_MS", 1000),
            timeout_ms: env_var_or_default("FABRIC_PROBE_TIMEOUT_MS", 500),
            failure_threshold: env_var_or_default("FABRIC_FAILURE_THRESHOLD", 3),
            success_threshold: env_var_or_default("FABRIC_SUCCESS_THRESHOLD", 2),
            latency_window: env_var_or_default("FABRIC_LATENCY_WINDOW", 32),
        }
    }
}

/// Path computation configuration
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Maximum number of paths in a multipath set
    pub fan_out: usize,
    /// Cost multiplier for traversing a Suspect element
    pub suspect_penalty: f64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            fan_out: env_var_or_default("FABRIC_PATH_FAN_OUT", 2),
            suspect_penalty: env_var_or_default("FABRIC_SUSPECT_PENALTY", 10.0),
        }
    }
}

/// Failure recovery configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum route installation attempts before demoting to Unreachable
    pub max_install_attempts: u32,
    /// Base delay between installation retries in milliseconds
    pub retry_delay_ms: u64,
    /// Backoff multiplier applied to the retry delay after each failure
    pub backoff_multiplier: f64,
    /// Deadline for a single recovery operation in milliseconds
    pub recovery_deadline_ms: u64,
}

impl RecoveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn recovery_deadline(&self) -> Duration {
        Duration::from_millis(self.recovery_deadline_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_install_attempts: env_var_or_default("FABRIC_MAX_INSTALL_ATTEMPTS", 3),
            retry_delay_ms: env_var_or_default("FABRIC_RETRY_DELAY_MS", 100),
            backoff_multiplier: env_var_or_default("FABRIC_BACKOFF_MULTIPLIER", 2.0),
            recovery_deadline_ms: env_var_or_default("FABRIC_RECOVERY_DEADLINE_MS", 5000),
        }
    }
}

/// Optimizer feedback configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Whether externally supplied cost bias is applied at all
    pub enabled: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: env_var_or_default("FABRIC_OPTIMIZER_ENABLED", true),
        }
    }
}

/// Snapshot and event export configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Number of recent events retained in the published snapshot
    pub recent_events: usize,
    /// Capacity of the monitor -> engine event channel
    pub event_queue_depth: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            recent_events: env_var_or_default("FABRIC_RECENT_EVENTS", 64),
            event_queue_depth: env_var_or_default("FABRIC_EVENT_QUEUE_DEPTH", 128),
        }
    }
}

/// Global configuration instance
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub probe: ProbeConfig,
    pub path: PathConfig,
    pub recovery: RecoveryConfig,
    pub optimizer: OptimizerConfig,
    pub snapshot: SnapshotConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.probe.failure_threshold, 3);
        assert_eq!(config.probe.success_threshold, 2);
        assert_eq!(config.probe.timeout(), Duration::from_millis(500));
        assert_eq!(config.path.fan_out, 2);
        assert!(config.path.suspect_penalty >= 10.0);
        assert_eq!(config.recovery.recovery_deadline(), Duration::from_secs(5));
    }
}
