//! Built-in heartbeat tasks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::audit::index::AuditIndex;
use crate::audit::verify_chain;
use crate::config::SharedConfig;
use crate::gate::{cause_for, SafetyGate};
use crate::kill_switch::{
    AnomalySignal, AnomalyThresholds, KillSwitch, SustainedTracker, TriggerCause,
};
use crate::trust::{SkillRegistry, UntrustedReason};

use super::health::{write_health_file, HealthReport, ResourceSampler};
use super::{HeartbeatTask, TaskContext, TaskTier};

/// Re-verifies every registered skill.
pub const SKILL_INTEGRITY_CHECK: &str = "skill_integrity_check";
/// Samples CPU and memory and writes `health.json`.
pub const SYSTEM_HEALTH_CHECK: &str = "system_health_check";
/// Walks the audit hash chain.
pub const AUDIT_CHAIN_CHECK: &str = "audit_chain_check";
/// Copies new audit entries into the search index.
pub const AUDIT_INDEX_UPDATE: &str = "audit_index_update";
/// Drops expired confirmation tokens.
pub const STALE_STATE_CHECK: &str = "stale_state_check";

/// Re-verify all skills; an untrusted skill may trigger the kill switch.
pub struct SkillIntegrityCheck {
    registry: Arc<SkillRegistry>,
    kill_switch: Arc<KillSwitch>,
    config: SharedConfig,
}

impl SkillIntegrityCheck {
    /// Build the task.
    pub fn new(
        registry: Arc<SkillRegistry>,
        kill_switch: Arc<KillSwitch>,
        config: SharedConfig,
    ) -> Self {
        Self {
            registry,
            kill_switch,
            config,
        }
    }
}

/// Kill-switch cause for a skill found untrusted at rest.
///
/// A source file with no manifest was placed by something other than the
/// registry, so it counts as unauthorized file access rather than an
/// attempt to execute an unsigned skill.
pub fn integrity_cause(reason: UntrustedReason) -> TriggerCause {
    match reason {
        UntrustedReason::ManifestMissing => TriggerCause::UnauthorizedFileAccess,
        other => cause_for(other),
    }
}

#[async_trait]
impl HeartbeatTask for SkillIntegrityCheck {
    fn name(&self) -> &'static str {
        SKILL_INTEGRITY_CHECK
    }

    fn tier(&self) -> TaskTier {
        TaskTier::ReadOnly
    }

    async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<String> {
        let registry = Arc::clone(&self.registry);
        let results = tokio::task::spawn_blocking(move || registry.verify_all())
            .await
            .context("skill verification panicked")??;

        let untrusted: Vec<_> = results.iter().filter(|r| !r.is_trusted()).collect();
        let trigger_enabled = self.config.current()?.kill_switch.trigger_on_untrusted_skill;

        if let Some(reason) = untrusted.first().and_then(|r| r.reason()) {
            let listed = untrusted
                .iter()
                .map(|r| match r.reason() {
                    Some(reason) => format!("{} ({reason})", r.name),
                    None => r.name.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            if trigger_enabled {
                self.kill_switch.trigger(
                    integrity_cause(reason),
                    &format!("integrity check: {} untrusted skill(s): {listed}", untrusted.len()),
                )?;
            } else {
                warn!(skills = %listed, "untrusted skills found; trigger disabled");
            }
        }

        Ok(format!(
            "{} skills verified, {} untrusted",
            results.len(),
            untrusted.len()
        ))
    }
}

#[derive(Debug)]
struct Trackers {
    thresholds: AnomalyThresholds,
    cpu: SustainedTracker,
    memory: SustainedTracker,
    disk: SustainedTracker,
    low_memory: SustainedTracker,
}

impl Trackers {
    #[allow(clippy::cast_precision_loss)]
    fn new(thresholds: AnomalyThresholds) -> Self {
        Self {
            thresholds,
            cpu: SustainedTracker::new(thresholds.cpu_percent),
            memory: SustainedTracker::new(thresholds.memory_percent),
            disk: SustainedTracker::new(thresholds.disk_percent),
            low_memory: SustainedTracker::below(thresholds.min_available_memory_mb as f64),
        }
    }

    /// Follow a config reload; trackers whose threshold moved start over.
    fn retarget(&mut self, thresholds: AnomalyThresholds) {
        if thresholds == self.thresholds {
            return;
        }
        let fresh = Self::new(thresholds);
        if fresh.cpu.threshold() != self.cpu.threshold() {
            self.cpu = fresh.cpu;
        }
        if fresh.memory.threshold() != self.memory.threshold() {
            self.memory = fresh.memory;
        }
        if fresh.disk.threshold() != self.disk.threshold() {
            self.disk = fresh.disk;
        }
        if fresh.low_memory.threshold() != self.low_memory.threshold() {
            self.low_memory = fresh.low_memory;
        }
        self.thresholds = thresholds;
    }
}

/// Sample resources, write `health.json`, and trigger on sustained pressure.
pub struct SystemHealthCheck {
    sampler: Arc<dyn ResourceSampler>,
    kill_switch: Arc<KillSwitch>,
    config: SharedConfig,
    report_path: PathBuf,
    trackers: Mutex<Trackers>,
}

impl SystemHealthCheck {
    /// Build the task. Thresholds are read from `config` on every run.
    pub fn new(
        sampler: Arc<dyn ResourceSampler>,
        kill_switch: Arc<KillSwitch>,
        config: SharedConfig,
        report_path: impl Into<PathBuf>,
    ) -> Self {
        let thresholds = kill_switch.thresholds();
        Self {
            sampler,
            kill_switch,
            config,
            report_path: report_path.into(),
            trackers: Mutex::new(Trackers::new(thresholds)),
        }
    }
}

#[async_trait]
impl HeartbeatTask for SystemHealthCheck {
    fn name(&self) -> &'static str {
        SYSTEM_HEALTH_CHECK
    }

    fn tier(&self) -> TaskTier {
        TaskTier::ReadOnly
    }

    #[allow(clippy::cast_precision_loss)]
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<String> {
        let thresholds = self.config.current()?.kill_switch.thresholds();
        self.kill_switch.set_thresholds(thresholds);

        let sampler = Arc::clone(&self.sampler);
        let sample = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .context("resource sampler panicked")??;

        let (cpu_for, memory_for, disk_for, low_memory_for) = {
            let mut trackers = self
                .trackers
                .lock()
                .map_err(|_| anyhow::anyhow!("tracker lock poisoned"))?;
            trackers.retarget(thresholds);
            let disk_for = match sample.disk_percent {
                Some(pct) => trackers.disk.observe(pct, ctx.now),
                None => {
                    trackers.disk.reset();
                    Duration::ZERO
                }
            };
            (
                trackers.cpu.observe(sample.cpu_percent, ctx.now),
                trackers.memory.observe(sample.memory_percent, ctx.now),
                disk_for,
                trackers
                    .low_memory
                    .observe(sample.memory_available_mb as f64, ctx.now),
            )
        };

        let mut signals = vec![
            AnomalySignal::Cpu {
                percent: sample.cpu_percent,
                sustained_for: cpu_for,
            },
            AnomalySignal::Memory {
                percent: sample.memory_percent,
                sustained_for: memory_for,
            },
            AnomalySignal::LowMemory {
                available_mb: sample.memory_available_mb,
                sustained_for: low_memory_for,
            },
        ];
        if let Some(percent) = sample.disk_percent {
            signals.push(AnomalySignal::Disk {
                percent,
                sustained_for: disk_for,
            });
        }

        let anomalies: Vec<String> = signals
            .iter()
            .filter(|signal| past_threshold(signal, &thresholds))
            .map(AnomalySignal::describe)
            .collect();

        let mut triggered = false;
        if let Some(signal) = signals
            .iter()
            .find(|signal| self.kill_switch.is_trigger_condition(signal))
        {
            triggered = self
                .kill_switch
                .trigger(TriggerCause::ResourceAnomaly, &signal.describe())?;
        }

        let report = HealthReport {
            timestamp: ctx.now.to_rfc3339(),
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            memory_available_mb: sample.memory_available_mb,
            disk_percent: sample.disk_percent,
            cpu_above_threshold_secs: cpu_for.as_secs(),
            memory_above_threshold_secs: memory_for.as_secs(),
            disk_above_threshold_secs: disk_for.as_secs(),
            low_memory_secs: low_memory_for.as_secs(),
            anomalies,
            kill_switch: self.kill_switch.state().to_string(),
        };
        write_health_file(&report, &self.report_path)?;
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            available_mb = sample.memory_available_mb,
            disk = ?sample.disk_percent,
            "health sampled"
        );

        let mut message = format!(
            "cpu {:.1}% memory {:.1}% ({}MB available)",
            sample.cpu_percent, sample.memory_percent, sample.memory_available_mb
        );
        if let Some(disk) = sample.disk_percent {
            message.push_str(&format!(" disk {disk:.1}%"));
        }
        if triggered {
            message.push_str("; resource anomaly triggered kill switch");
        }
        Ok(message)
    }
}

/// Whether `signal` is past its threshold, regardless of how long.
fn past_threshold(signal: &AnomalySignal, thresholds: &AnomalyThresholds) -> bool {
    match *signal {
        AnomalySignal::Cpu { percent, .. } => percent > thresholds.cpu_percent,
        AnomalySignal::Memory { percent, .. } => percent > thresholds.memory_percent,
        AnomalySignal::Disk { percent, .. } => percent > thresholds.disk_percent,
        AnomalySignal::LowMemory { available_mb, .. } => {
            available_mb < thresholds.min_available_memory_mb
        }
    }
}

/// Walk the audit chain; a break means the log was tampered with.
pub struct AuditChainCheck {
    log_path: PathBuf,
    kill_switch: Arc<KillSwitch>,
}

impl AuditChainCheck {
    /// Build the task over the log at `log_path`.
    pub fn new(log_path: impl Into<PathBuf>, kill_switch: Arc<KillSwitch>) -> Self {
        Self {
            log_path: log_path.into(),
            kill_switch,
        }
    }
}

#[async_trait]
impl HeartbeatTask for AuditChainCheck {
    fn name(&self) -> &'static str {
        AUDIT_CHAIN_CHECK
    }

    fn tier(&self) -> TaskTier {
        TaskTier::ReadOnly
    }

    async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<String> {
        let path = self.log_path.clone();
        let report = tokio::task::spawn_blocking(move || verify_chain(&path))
            .await
            .context("audit chain walk panicked")??;

        if let Some(brk) = &report.first_break {
            self.kill_switch.trigger(
                TriggerCause::UnauthorizedFileAccess,
                &format!("audit chain broken at {brk}"),
            )?;
            anyhow::bail!(
                "audit chain broken after {} intact entries: {brk}",
                report.entries
            );
        }
        Ok(format!("audit chain intact ({} entries)", report.entries))
    }
}

/// Bring the search index up to date with the log.
pub struct AuditIndexUpdate {
    index: Arc<AuditIndex>,
    log_path: PathBuf,
}

impl AuditIndexUpdate {
    /// Build the task.
    pub fn new(index: Arc<AuditIndex>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            log_path: log_path.into(),
        }
    }
}

#[async_trait]
impl HeartbeatTask for AuditIndexUpdate {
    fn name(&self) -> &'static str {
        AUDIT_INDEX_UPDATE
    }

    fn tier(&self) -> TaskTier {
        TaskTier::ReadWrite
    }

    async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<String> {
        let added = self.index.sync(&self.log_path).await?;
        Ok(format!("indexed {added} new entries"))
    }
}

/// Drop confirmation tokens past their expiry.
pub struct StaleStateCheck {
    gate: Arc<SafetyGate>,
}

impl StaleStateCheck {
    /// Build the task.
    pub fn new(gate: Arc<SafetyGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl HeartbeatTask for StaleStateCheck {
    fn name(&self) -> &'static str {
        STALE_STATE_CHECK
    }

    fn tier(&self) -> TaskTier {
        TaskTier::ReadWrite
    }

    async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<String> {
        let removed = self.gate.gc_expired();
        Ok(format!("removed {removed} expired confirmations"))
    }
}
