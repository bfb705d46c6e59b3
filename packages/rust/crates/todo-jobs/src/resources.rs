//! Resource sampling and the dynamic concurrency ceiling.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::{CEILING_CAP, CEILING_FLOOR};
use crate::error::{JobError, Result};

/// Reading used when system metrics cannot be read. Sits between the low and
/// high water marks, so it never moves the ceiling.
const NEUTRAL_FRACTION: f64 = 0.5;

/// Host metrics needed by the sampler.
pub trait MetricsSource: Send + Sync {
    /// Total memory in bytes.
    ///
    /// # Errors
    ///
    /// [`JobError::ResourceMetricsUnavailable`] when the host cannot be queried.
    fn total_memory(&self) -> Result<u64>;

    /// Free (available) memory in bytes.
    ///
    /// # Errors
    ///
    /// [`JobError::ResourceMetricsUnavailable`] when the host cannot be queried.
    fn free_memory(&self) -> Result<u64>;

    /// CPU load as a fraction in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// [`JobError::ResourceMetricsUnavailable`] when the host cannot be queried.
    fn cpu_load(&self) -> Result<f64>;
}

/// [`MetricsSource`] backed by `sysinfo`.
pub struct SysinfoMetrics {
    system: Mutex<System>,
}

impl SysinfoMetrics {
    /// Create a sampler handle. CPU usage needs two refreshes to be meaningful,
    /// so the first reading is usually 0.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoMetrics {
    fn total_memory(&self) -> Result<u64> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        match system.total_memory() {
            0 => Err(JobError::ResourceMetricsUnavailable(
                "total memory reported as zero".to_string(),
            )),
            total => Ok(total),
        }
    }

    fn free_memory(&self) -> Result<u64> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        Ok(system.available_memory())
    }

    fn cpu_load(&self) -> Result<f64> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        let usage = f64::from(system.global_cpu_usage());
        if usage.is_finite() {
            Ok((usage / 100.0).clamp(0.0, 1.0))
        } else {
            Err(JobError::ResourceMetricsUnavailable(format!(
                "cpu usage is not finite: {usage}"
            )))
        }
    }
}

/// One resource sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Used memory fraction in `[0, 1]`.
    pub memory_fraction: f64,
    /// CPU load fraction in `[0, 1]`.
    pub cpu_fraction: f64,
    /// Jobs counted against the ceiling.
    pub active_jobs: usize,
    /// Jobs tracked by the store; never below `active_jobs`.
    pub total_jobs: usize,
    /// Ceiling in force after this sample was applied.
    pub concurrency_ceiling: usize,
}

/// Reads host pressure; never fails.
#[derive(Clone)]
pub struct ResourceSampler {
    source: Arc<dyn MetricsSource>,
}

impl ResourceSampler {
    /// Sampler over `source`.
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self { source }
    }

    fn read_fractions(&self) -> Result<(f64, f64)> {
        let total = self.source.total_memory()?;
        let free = self.source.free_memory()?.min(total);
        #[allow(clippy::cast_precision_loss)]
        let memory = (total - free) as f64 / total as f64;
        let cpu = self.source.cpu_load()?;
        Ok((memory.clamp(0.0, 1.0), cpu.clamp(0.0, 1.0)))
    }

    /// Take a sample. Metric failures are logged and replaced by a neutral
    /// reading.
    pub fn sample(&self, active_jobs: usize, total_jobs: usize, ceiling: usize) -> ResourceUsage {
        let (memory_fraction, cpu_fraction) = match self.read_fractions() {
            Ok(fractions) => fractions,
            Err(error) => {
                tracing::warn!(%error, "using neutral resource reading");
                (NEUTRAL_FRACTION, NEUTRAL_FRACTION)
            }
        };
        ResourceUsage {
            memory_fraction,
            cpu_fraction,
            active_jobs,
            total_jobs: total_jobs.max(active_jobs),
            concurrency_ceiling: ceiling,
        }
    }
}

/// Global concurrency ceiling moved by resource samples, one step at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyCeiling {
    current: usize,
    high_water: f64,
    low_water: f64,
}

impl ConcurrencyCeiling {
    /// Ceiling starting at `initial`, clamped to the floor and cap.
    pub fn new(initial: usize, high_water: f64, low_water: f64) -> Self {
        Self {
            current: initial.clamp(CEILING_FLOOR, CEILING_CAP),
            high_water,
            low_water,
        }
    }

    /// Current limit.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Apply one sample. Returns `Some((old, new))` when the ceiling moved.
    pub fn adjust(&mut self, memory_fraction: f64, cpu_fraction: f64) -> Option<(usize, usize)> {
        let old = self.current;
        if memory_fraction >= self.high_water {
            self.current = self.current.saturating_sub(1).max(CEILING_FLOOR);
        } else if memory_fraction < self.low_water && cpu_fraction < self.low_water {
            self.current = (self.current + 1).min(CEILING_CAP);
        }
        (old != self.current).then_some((old, self.current))
    }
}
