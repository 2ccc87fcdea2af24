//! System Resource Metrics
//!
//! Host CPU, memory, disk and load figures read through `sysinfo`. Any
//! figure the platform cannot provide reads as zero.

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, System};

/// Point-in-time host resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_average: f64,
}

/// Limits above which the gateway reports itself at least degraded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub disk_percent: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_percent: 85.0,
            cpu_percent: 80.0,
            disk_percent: 90.0,
        }
    }
}

impl ResourceUsage {
    /// Whether any figure is above its threshold.
    pub fn exceeds(&self, thresholds: &ResourceThresholds) -> bool {
        self.cpu_percent > thresholds.cpu_percent
            || self.memory_percent > thresholds.memory_percent
            || self.disk_percent > thresholds.disk_percent
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Sampler holding the `sysinfo` state between refreshes.
pub struct SystemSampler {
    system: Mutex<System>,
    last: Mutex<ResourceUsage>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            last: Mutex::new(ResourceUsage::default()),
        }
    }

    /// Refresh and return current usage.
    ///
    /// CPU usage is computed between two refreshes, so the first sample
    /// after startup may read low.
    pub fn sample(&self) -> ResourceUsage {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = system.global_cpu_usage() as f64;
            let memory = percent(system.used_memory(), system.total_memory());
            (if cpu.is_finite() { cpu } else { 0.0 }, memory)
        };

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));

        let load = System::load_average().one;

        let usage = ResourceUsage {
            cpu_percent,
            memory_percent,
            disk_percent: percent(total.saturating_sub(available), total),
            load_average: if load.is_finite() { load } else { 0.0 },
        };
        *self.last.lock() = usage;
        usage
    }

    /// Most recent sample without refreshing.
    pub fn last(&self) -> ResourceUsage {
        *self.last.lock()
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_percent_handles_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }

    #[test]
    fn test_exceeds_thresholds() {
        let thresholds = ResourceThresholds::default();
        assert!(!ResourceUsage::default().exceeds(&thresholds));

        let hot = ResourceUsage {
            cpu_percent: 95.0,
            ..Default::default()
        };
        assert!(hot.exceeds(&thresholds));

        let full = ResourceUsage {
            disk_percent: 91.0,
            ..Default::default()
        };
        assert!(full.exceeds(&thresholds));
    }

    #[test]
    fn test_sample_is_within_bounds() {
        let sampler = SystemSampler::new();
        let usage = sampler.sample();
        assert!(usage.memory_percent >= 0.0 && usage.memory_percent <= 100.0);
        assert!(usage.disk_percent >= 0.0 && usage.disk_percent <= 100.0);
        assert!(usage.load_average >= 0.0);
        assert_eq!(sampler.last(), usage);
    }
}
