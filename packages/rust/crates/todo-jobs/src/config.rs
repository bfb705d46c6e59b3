//! Orchestrator configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lowest value the dynamic ceiling may reach.
pub const CEILING_FLOOR: usize = 2;
/// Highest value the dynamic ceiling may reach.
pub const CEILING_CAP: usize = 10;

/// Config for the job orchestrator and its resource sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Starting value of the global concurrency ceiling.
    pub max_concurrent_jobs: usize,
    /// Per-command overrides; never exceeded even with global capacity left.
    /// A limit of 0 disables the command.
    pub command_limits: HashMap<String, usize>,
    /// Memory fraction at or above which the ceiling shrinks.
    pub memory_high_water: f64,
    /// Memory and CPU fraction below which the ceiling grows.
    pub low_water: f64,
    /// Resource sampling interval in milliseconds.
    pub sample_interval_ms: u64,
    /// Terminal jobs older than this are purged.
    pub retention_days: u64,
    /// Interval between retention sweeps in seconds.
    pub sweep_interval_secs: u64,
    /// Time `cancel_job` waits for the process to exit after killing it.
    pub cancel_grace_ms: u64,
    /// Job store directory; `None` keeps jobs in memory only.
    pub store_root: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            command_limits: HashMap::from([("deploy".to_string(), 1)]),
            memory_high_water: 0.9,
            low_water: 0.4,
            sample_interval_ms: 5_000,
            retention_days: 7,
            sweep_interval_secs: 3_600,
            cancel_grace_ms: 5_000,
            store_root: None,
        }
    }
}

impl OrchestratorConfig {
    /// Clamp values into their supported ranges.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_jobs = self.max_concurrent_jobs.clamp(CEILING_FLOOR, CEILING_CAP);
        self.memory_high_water = self.memory_high_water.clamp(0.0, 1.0);
        self.low_water = self.low_water.clamp(0.0, self.memory_high_water);
        self.sample_interval_ms = self.sample_interval_ms.max(10);
        self.sweep_interval_secs = self.sweep_interval_secs.max(1);
        self
    }

    /// The override for `command`, if any.
    pub fn command_limit(&self, command: &str) -> Option<usize> {
        self.command_limits.get(command).copied()
    }

    /// Declare a per-command limit.
    #[must_use]
    pub fn with_command_limit(mut self, command: impl Into<String>, limit: usize) -> Self {
        self.command_limits.insert(command.into(), limit);
        self
    }

    pub(crate) fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub(crate) fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub(crate) fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_declares_single_deploy() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.command_limit("deploy"), Some(1));
        assert_eq!(config.command_limit("store"), None);
        assert_eq!(config.retention(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn normalized_clamps_ceiling() {
        let low = OrchestratorConfig {
            max_concurrent_jobs: 0,
            ..OrchestratorConfig::default()
        }
        .normalized();
        assert_eq!(low.max_concurrent_jobs, CEILING_FLOOR);

        let high = OrchestratorConfig {
            max_concurrent_jobs: 64,
            ..OrchestratorConfig::default()
        }
        .normalized();
        assert_eq!(high.max_concurrent_jobs, CEILING_CAP);
    }

    #[test]
    fn zero_command_limit_survives_normalization() {
        let config = OrchestratorConfig::default()
            .with_command_limit("sync", 0)
            .normalized();
        assert_eq!(config.command_limit("sync"), Some(0));
    }
}
