//! Resource sampling and `health.json` writing.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage;

/// Point-in-time resource utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// CPU utilisation, 0-100.
    pub cpu_percent: f64,
    /// Memory utilisation, 0-100.
    pub memory_percent: f64,
    /// Memory available to new processes, MiB.
    pub memory_available_mb: u64,
    /// Disk utilisation of the watched filesystem, 0-100, when readable.
    #[serde(default)]
    pub disk_percent: Option<f64>,
}

/// Source of resource samples.
pub trait ResourceSampler: Send + Sync {
    /// Take one sample. May block briefly.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform counters cannot be read.
    fn sample(&self) -> anyhow::Result<ResourceSample>;
}

/// Health report written to `<root>/health.json` on every health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// RFC 3339 time of the sample.
    pub timestamp: String,
    /// CPU utilisation.
    pub cpu_percent: f64,
    /// Memory utilisation.
    pub memory_percent: f64,
    /// Available memory, MiB.
    pub memory_available_mb: u64,
    /// Disk utilisation, when readable.
    pub disk_percent: Option<f64>,
    /// Seconds CPU has stayed above threshold.
    pub cpu_above_threshold_secs: u64,
    /// Seconds memory has stayed above threshold.
    pub memory_above_threshold_secs: u64,
    /// Seconds disk has stayed above threshold.
    pub disk_above_threshold_secs: u64,
    /// Seconds available memory has stayed below the minimum.
    pub low_memory_secs: u64,
    /// Signals currently past their threshold, e.g. `disk 93.0% for 0s`.
    pub anomalies: Vec<String>,
    /// Kill-switch state at sample time.
    pub kill_switch: String,
}

/// Atomically write the health report.
///
/// # Errors
///
/// Returns an error if serialization or the atomic write fails.
pub fn write_health_file(report: &HealthReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report).context("failed to serialize health report")?;
    storage::write_atomic(path, &json)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Cumulative CPU jiffies from the aggregate `/proc/stat` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields
        .get(3)
        .copied()
        .unwrap_or(0)
        .saturating_add(fields.get(4).copied().unwrap_or(0));
    let total = fields.iter().fold(0u64, |acc, v| acc.saturating_add(*v));
    Some(CpuTimes { idle, total })
}

#[allow(clippy::cast_precision_loss)]
fn cpu_percent_between(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    let idle = after.idle.saturating_sub(before.idle);
    if total == 0 {
        return 0.0;
    }
    let busy = total.saturating_sub(idle);
    (busy as f64 / total as f64) * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MemoryReading {
    percent: f64,
    available_mb: u64,
}

#[allow(clippy::cast_precision_loss)]
fn parse_meminfo(meminfo: &str) -> Option<MemoryReading> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(MemoryReading {
        percent: (used as f64 / total as f64) * 100.0,
        available_mb: available / 1024,
    })
}

/// Used percentage from POSIX `df -Pk` output (used over used plus
/// available, the way `df` computes capacity).
#[allow(clippy::cast_precision_loss)]
fn parse_df_percent(output: &str) -> Option<f64> {
    let line = output.lines().nth(1)?;
    let mut fields = line.split_whitespace().skip(2);
    let used: u64 = fields.next()?.parse().ok()?;
    let available: u64 = fields.next()?.parse().ok()?;
    let total = used.saturating_add(available);
    if total == 0 {
        return None;
    }
    Some((used as f64 / total as f64) * 100.0)
}

fn disk_percent(path: &Path) -> anyhow::Result<f64> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .context("failed to run df")?;
    if !output.status.success() {
        anyhow::bail!("df exited with {}", output.status);
    }
    parse_df_percent(&String::from_utf8_lossy(&output.stdout)).context("unrecognised df output")
}

/// Linux sampler reading `/proc/stat`, `/proc/meminfo` and `df`.
///
/// CPU utilisation is the delta since the previous sample; the first call
/// takes two readings a short interval apart. Disk usage is that of the
/// filesystem holding `disk_path` (default `/`).
#[derive(Debug, Default)]
pub struct ProcSampler {
    previous: Mutex<Option<CpuTimes>>,
    disk_path: Option<PathBuf>,
}

impl ProcSampler {
    /// New sampler with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the filesystem holding `path` for disk usage.
    #[must_use]
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = Some(path.into());
        self
    }

    fn read_cpu() -> anyhow::Result<CpuTimes> {
        let stat = std::fs::read_to_string("/proc/stat").context("failed to read /proc/stat")?;
        parse_cpu_times(&stat).context("unrecognised /proc/stat format")
    }
}

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> anyhow::Result<ResourceSample> {
        let mut previous = self
            .previous
            .lock()
            .map_err(|_| anyhow::anyhow!("sampler lock poisoned"))?;
        let before = match *previous {
            Some(times) => times,
            None => {
                let first = Self::read_cpu()?;
                std::thread::sleep(std::time::Duration::from_millis(250));
                first
            }
        };
        let after = Self::read_cpu()?;
        *previous = Some(after);

        let meminfo =
            std::fs::read_to_string("/proc/meminfo").context("failed to read /proc/meminfo")?;
        let memory = parse_meminfo(&meminfo).context("unrecognised /proc/meminfo format")?;

        let disk_path = self.disk_path.as_deref().unwrap_or_else(|| Path::new("/"));
        let disk_percent = match disk_percent(disk_path) {
            Ok(pct) => Some(pct),
            Err(e) => {
                warn!(path = %disk_path.display(), error = %e, "disk usage unavailable");
                None
            }
        };

        Ok(ResourceSample {
            cpu_percent: cpu_percent_between(before, after),
            memory_percent: memory.percent,
            memory_available_mb: memory.available_mb,
            disk_percent,
        })
    }
}
