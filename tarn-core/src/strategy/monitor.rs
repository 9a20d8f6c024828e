//! Process resource monitoring for strategy policing
//!
//! Samples process CPU% and RSS on an interval; the executor applies the
//! configured policy when thresholds are exceeded. Sampling reads /proc on
//! Linux and degrades to no readings elsewhere.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// What to do when resource thresholds are exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePolicy {
    /// Log and keep going
    WarnOnly,
    /// Refuse to load additional strategies
    BlockNewLoads,
    /// Stop the lowest-priority running strategy
    StopLowestPriority,
    /// Stop every running strategy
    StopAll,
}

/// One resource reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// Process CPU over the sample window, percent of one core
    pub cpu_pct: f64,
    /// Resident set size in megabytes
    pub rss_mb: f64,
}

/// CPU accounting state between samples.
pub struct CpuSampler {
    last_process_ticks: u64,
    last_sample: Instant,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self {
            last_process_ticks: read_process_ticks().unwrap_or(0),
            last_sample: Instant::now(),
        }
    }

    /// Take a reading. Returns None off-Linux or when /proc is unreadable.
    pub fn sample(&mut self) -> Option<ResourceUsage> {
        let ticks = read_process_ticks()?;
        let elapsed = self.last_sample.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let tick_hz = 100.0; // USER_HZ on every mainstream Linux
        let delta_ticks = ticks.saturating_sub(self.last_process_ticks) as f64;
        let cpu_pct = (delta_ticks / tick_hz) / elapsed * 100.0;

        self.last_process_ticks = ticks;
        self.last_sample = Instant::now();

        let rss_mb = read_rss_mb()?;
        let usage = ResourceUsage { cpu_pct, rss_mb };
        debug!(cpu_pct = usage.cpu_pct, rss_mb = usage.rss_mb, "resource sample");
        Some(usage)
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// utime + stime from /proc/self/stat, in clock ticks.
#[cfg(target_os = "linux")]
fn read_process_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Field 2 (comm) may contain spaces; skip past the closing paren
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: field 0 is state; utime and stime are fields 11 and 12
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_process_ticks() -> Option<u64> {
    None
}

/// Resident set size from /proc/self/statm, in megabytes.
#[cfg(target_os = "linux")]
fn read_rss_mb() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_kb = 4.0; // 4 KiB pages on every mainstream Linux
    Some(pages * page_kb / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_mb() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_sampler_reads_proc() {
        let mut sampler = CpuSampler::new();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let usage = sampler.sample().expect("reading /proc should work on linux");
        assert!(usage.rss_mb > 0.0);
        assert!(usage.cpu_pct >= 0.0);
    }

    #[test]
    fn test_policy_serde() {
        let policy: ResourcePolicy = serde_json::from_str("\"stop_lowest_priority\"").unwrap();
        assert_eq!(policy, ResourcePolicy::StopLowestPriority);
    }
}
