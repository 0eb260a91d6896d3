//! Classification of resource anomaly signals.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A resource observation sustained over some window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum AnomalySignal {
    /// CPU utilisation.
    Cpu {
        /// Latest utilisation, 0-100.
        percent: f64,
        /// How long utilisation has stayed above the threshold.
        sustained_for: Duration,
    },
    /// Memory utilisation.
    Memory {
        /// Latest utilisation, 0-100.
        percent: f64,
        /// How long utilisation has stayed above the threshold.
        sustained_for: Duration,
    },
    /// Disk utilisation of the state directory's filesystem.
    Disk {
        /// Latest utilisation, 0-100.
        percent: f64,
        /// How long utilisation has stayed above the threshold.
        sustained_for: Duration,
    },
    /// Available memory.
    LowMemory {
        /// Latest available memory in MiB.
        available_mb: u64,
        /// How long it has stayed below the minimum.
        sustained_for: Duration,
    },
}

impl AnomalySignal {
    /// Short description for cause details.
    pub fn describe(&self) -> String {
        match self {
            Self::Cpu { percent, sustained_for } => {
                format!("cpu {percent:.1}% for {}s", sustained_for.as_secs())
            }
            Self::Memory { percent, sustained_for } => {
                format!("memory {percent:.1}% for {}s", sustained_for.as_secs())
            }
            Self::Disk { percent, sustained_for } => {
                format!("disk {percent:.1}% for {}s", sustained_for.as_secs())
            }
            Self::LowMemory { available_mb, sustained_for } => {
                format!("{available_mb}MB memory available for {}s", sustained_for.as_secs())
            }
        }
    }
}

/// Limits above which a sustained signal triggers the kill switch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyThresholds {
    /// CPU percentage threshold.
    pub cpu_percent: f64,
    /// CPU window; the signal must last longer than this.
    pub cpu_window: Duration,
    /// Memory percentage threshold.
    pub memory_percent: f64,
    /// Memory window.
    pub memory_window: Duration,
    /// Disk percentage threshold.
    pub disk_percent: f64,
    /// Disk window.
    pub disk_window: Duration,
    /// Available memory below this many MiB is a low-memory signal; it
    /// shares the memory window.
    pub min_available_memory_mb: u64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            cpu_window: Duration::from_secs(60),
            memory_percent: 90.0,
            memory_window: Duration::from_secs(60),
            disk_percent: 90.0,
            disk_window: Duration::from_secs(60),
            min_available_memory_mb: 500,
        }
    }
}

/// Whether `signal` exceeds its threshold for longer than its window.
pub fn is_trigger_condition(signal: &AnomalySignal, thresholds: &AnomalyThresholds) -> bool {
    match *signal {
        AnomalySignal::Cpu {
            percent,
            sustained_for,
        } => percent > thresholds.cpu_percent && sustained_for > thresholds.cpu_window,
        AnomalySignal::Memory {
            percent,
            sustained_for,
        } => percent > thresholds.memory_percent && sustained_for > thresholds.memory_window,
        AnomalySignal::Disk {
            percent,
            sustained_for,
        } => percent > thresholds.disk_percent && sustained_for > thresholds.disk_window,
        AnomalySignal::LowMemory {
            available_mb,
            sustained_for,
        } => {
            available_mb < thresholds.min_available_memory_mb
                && sustained_for > thresholds.memory_window
        }
    }
}

/// Turns point samples into "past threshold since" durations.
#[derive(Debug, Clone)]
pub struct SustainedTracker {
    threshold: f64,
    below: bool,
    above_since: Option<DateTime<Utc>>,
}

impl SustainedTracker {
    /// Tracker for values above `threshold`.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            below: false,
            above_since: None,
        }
    }

    /// Tracker for values below `threshold`.
    pub fn below(threshold: f64) -> Self {
        Self {
            threshold,
            below: true,
            above_since: None,
        }
    }

    /// Threshold this tracker compares against.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Record a sample at `at`; returns how long the value has been past
    /// the threshold (zero when the sample is back within it).
    pub fn observe(&mut self, value: f64, at: DateTime<Utc>) -> Duration {
        let past = if self.below {
            value < self.threshold
        } else {
            value > self.threshold
        };
        if !past {
            self.above_since = None;
            return Duration::ZERO;
        }
        let since = *self.above_since.get_or_insert(at);
        at.signed_duration_since(since)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Forget any ongoing excursion.
    pub fn reset(&mut self) {
        self.above_since = None;
    }
}
