//! Wiring of the control plane from a resolved [`Config`].
//!
//! [`ControlPlane::open`] builds every component over the configured paths,
//! sharing one audit log. Callers outside the crate go through
//! [`ControlPlane::execute_skill`], which is the only route from a skill name
//! to running code: gate, then verified load, then runtime.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::audit::index::AuditIndex;
use crate::audit::{source, AuditLevel, AuditLog, AuditRecord};
use crate::config::{Config, RuntimePaths, SharedConfig};
use crate::gate::{ActionKind, ActionRequest, Decision, DenyReason, SafetyGate};
use crate::heartbeat::tasks::{
    AuditChainCheck, AuditIndexUpdate, SkillIntegrityCheck, StaleStateCheck, SystemHealthCheck,
};
use crate::heartbeat::{HeartbeatScheduler, ProcSampler, ResourceSampler};
use crate::kill_switch::{KillSwitch, KillSwitchState};
use crate::trust::{
    KeyStore, PatternScanner, ProcessRuntime, SkillEntry, SkillRegistry, SkillRuntime,
};

/// Outcome of [`ControlPlane::execute_skill`].
#[derive(Debug, Clone, PartialEq)]
pub enum SkillOutcome {
    /// The skill ran; its output.
    Completed(Value),
    /// Operator approval needed; resubmit with `token`.
    NeedsConfirmation {
        /// Token to resubmit with.
        token: String,
        /// When the token expires.
        expires_at: DateTime<Utc>,
    },
    /// The gate refused.
    Denied(DenyReason),
}

/// Every control-plane component, built over one configuration.
pub struct ControlPlane {
    /// Live configuration.
    pub config: SharedConfig,
    /// Resolved filesystem locations.
    pub paths: RuntimePaths,
    /// Shared audit log.
    pub audit: Arc<AuditLog>,
    /// Signing keys.
    pub keys: Arc<KeyStore>,
    /// Skill catalog.
    pub registry: Arc<SkillRegistry>,
    /// Global halt.
    pub kill_switch: Arc<KillSwitch>,
    /// Policy engine.
    pub gate: Arc<SafetyGate>,
    runtime: Arc<dyn SkillRuntime>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("root", &self.paths.root)
            .field("kill_switch", &self.kill_switch.state())
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Open every component at the configured paths.
    ///
    /// # Errors
    ///
    /// Returns an error if any store cannot be opened (unreadable audit log,
    /// insecure key permissions, corrupt kill-switch record).
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let paths = config.runtime_paths()?;
        std::fs::create_dir_all(&paths.root)
            .with_context(|| format!("failed to create {}", paths.root.display()))?;

        let audit = Arc::new(
            AuditLog::open(&paths.audit_log)
                .with_context(|| format!("failed to open audit log {}", paths.audit_log.display()))?,
        );
        let keys = Arc::new(
            KeyStore::open(&paths.key_dir, Arc::clone(&audit))
                .context("failed to open key store")?,
        );
        let registry = Arc::new(
            SkillRegistry::new(
                &paths.skills_dir,
                Arc::clone(&keys),
                Box::new(PatternScanner::new()),
                Arc::clone(&audit),
            )
            .context("failed to open skill registry")?,
        );
        let kill_switch = Arc::new(
            KillSwitch::open(
                &paths.kill_switch_state,
                Arc::clone(&audit),
                config.kill_switch.thresholds(),
            )
            .context("failed to load kill switch state")?,
        );

        let skills = &config.skills;
        let runtime: Arc<dyn SkillRuntime> = if skills.interpreter_args.is_empty() {
            Arc::new(ProcessRuntime::python(
                skills.interpreter.clone(),
                skills.execution_timeout(),
            ))
        } else {
            Arc::new(ProcessRuntime::new(
                skills.interpreter.clone(),
                skills.interpreter_args.clone(),
                skills.execution_timeout(),
            ))
        };

        let config = SharedConfig::new(config);
        let gate = Arc::new(SafetyGate::new(
            config.clone(),
            Arc::clone(&kill_switch),
            Arc::clone(&registry),
            Arc::clone(&audit),
        ));

        Ok(Self {
            config,
            paths,
            audit,
            keys,
            registry,
            kill_switch,
            gate,
            runtime,
        })
    }

    /// Replace the skill runtime.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn SkillRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Arm the kill switch if it has never been armed.
    ///
    /// # Errors
    ///
    /// Returns an error if the armed state cannot be persisted.
    pub fn ensure_armed(&self) -> anyhow::Result<()> {
        if self.kill_switch.state() == KillSwitchState::Disarmed {
            self.kill_switch.arm()?;
        }
        Ok(())
    }

    /// Scheduler with every built-in task registered, sampling resources
    /// from `/proc`.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit index cannot be opened.
    pub async fn scheduler(&self) -> anyhow::Result<HeartbeatScheduler> {
        self.scheduler_with(Arc::new(
            ProcSampler::new().with_disk_path(self.paths.root.clone()),
        ))
        .await
    }

    /// Scheduler with every built-in task registered over `sampler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit index cannot be opened.
    pub async fn scheduler_with(
        &self,
        sampler: Arc<dyn ResourceSampler>,
    ) -> anyhow::Result<HeartbeatScheduler> {
        let index = Arc::new(
            AuditIndex::open(&self.paths.audit_index)
                .await
                .context("failed to open audit index")?,
        );

        let mut scheduler = HeartbeatScheduler::new(
            self.config.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.audit),
        );
        scheduler.register(Arc::new(SkillIntegrityCheck::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.kill_switch),
            self.config.clone(),
        )));
        scheduler.register(Arc::new(SystemHealthCheck::new(
            sampler,
            Arc::clone(&self.kill_switch),
            self.config.clone(),
            self.paths.health_report.clone(),
        )));
        scheduler.register(Arc::new(AuditChainCheck::new(
            self.paths.audit_log.clone(),
            Arc::clone(&self.kill_switch),
        )));
        scheduler.register(Arc::new(AuditIndexUpdate::new(
            index,
            self.paths.audit_log.clone(),
        )));
        scheduler.register(Arc::new(StaleStateCheck::new(Arc::clone(&self.gate))));
        Ok(scheduler)
    }

    /// Gate, verify, and run a skill entry point.
    ///
    /// # Errors
    ///
    /// Returns an error when the skill passes the gate but fails the
    /// verified load (an untrusted skill) or the runtime fails.
    pub async fn execute_skill(
        &self,
        name: &str,
        entry: SkillEntry,
        input: Value,
        requested_by: &str,
        confirmation: Option<String>,
    ) -> anyhow::Result<SkillOutcome> {
        let mut request = ActionRequest::new(ActionKind::SkillExecute, name, requested_by);
        if let Some(token) = confirmation {
            request = request.with_confirmation(token);
        }

        match self.gate.evaluate(&request) {
            Decision::Allow => {}
            Decision::RequireConfirmation { token, expires_at } => {
                return Ok(SkillOutcome::NeedsConfirmation { token, expires_at })
            }
            Decision::Deny(reason) => return Ok(SkillOutcome::Denied(reason)),
        }

        let handle = self.registry.load_for_execution(name)?;
        let output = self
            .runtime
            .invoke(&handle, entry, input)
            .await
            .with_context(|| format!("skill {name} failed"))?;

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Audit, source::SKILL_RUNTIME, "skill_executed")
                .detail(format!(
                    "skill={name} entry={} digest={} requested_by={requested_by}",
                    entry.as_str(),
                    handle.digest()
                ))
                .outcome("completed"),
        ) {
            warn!(skill = %name, error = %e, "failed to audit log skill execution");
        }
        info!(skill = %name, entry = entry.as_str(), "skill executed");
        Ok(SkillOutcome::Completed(output))
    }
}
