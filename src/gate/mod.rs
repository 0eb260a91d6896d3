//! The single enforcement point for sensitive actions.
//!
//! [`SafetyGate::evaluate`] checks the kill switch, the action's tier, and,
//! for skill actions, the skill's signature, then returns
//! [`Decision::Allow`], [`Decision::RequireConfirmation`], or
//! [`Decision::Deny`]. Every call writes exactly one gate audit entry; a
//! decision that cannot be recorded becomes a `Deny(audit_unavailable)`.

pub mod action;
pub mod confirmation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::audit::{source, AuditLevel, AuditLog, AuditRecord};
use crate::config::SharedConfig;
use crate::kill_switch::{KillSwitch, TriggerCause};
use crate::trust::{RegistryError, SkillRegistry, UntrustedReason};

pub use action::{ActionKind, ActionRequest, Decision, DenyCode, DenyReason, SensitivityTier};
pub use confirmation::{ConfirmationStore, PendingConfirmation};

/// Decision counters since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    /// Allow decisions.
    pub allowed: u64,
    /// Confirmation tokens issued.
    pub confirmations_issued: u64,
    /// Deny decisions.
    pub denied: u64,
    /// Tokens currently outstanding.
    pub pending_confirmations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    confirmations_issued: AtomicU64,
    denied: AtomicU64,
}

/// Kill-switch cause for an untrusted skill.
pub fn cause_for(reason: UntrustedReason) -> TriggerCause {
    match reason {
        UntrustedReason::ManifestMissing => TriggerCause::UnsignedSkillExecution,
        UntrustedReason::SignatureInvalid => TriggerCause::SignatureVerificationFailure,
        UntrustedReason::DigestMismatch | UntrustedReason::SourceMissing => {
            TriggerCause::UnauthorizedFileAccess
        }
    }
}

/// Policy engine in front of every sensitive action.
pub struct SafetyGate {
    config: SharedConfig,
    kill_switch: Arc<KillSwitch>,
    registry: Arc<SkillRegistry>,
    audit: Arc<AuditLog>,
    confirmations: ConfirmationStore,
    counters: Counters,
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("kill_switch", &self.kill_switch.state())
            .field("pending", &self.confirmations.pending_count())
            .finish_non_exhaustive()
    }
}

impl SafetyGate {
    /// Build a gate over the shared components.
    pub fn new(
        config: SharedConfig,
        kill_switch: Arc<KillSwitch>,
        registry: Arc<SkillRegistry>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            kill_switch,
            registry,
            audit,
            confirmations: ConfirmationStore::new(),
            counters: Counters::default(),
        }
    }

    /// Decide whether `request` may proceed.
    pub fn evaluate(&self, request: &ActionRequest) -> Decision {
        let state = self.kill_switch.state();
        let halted = state.is_halted();

        let (mut decision, tier, note) = self.decide(request, halted);

        let level = if halted {
            AuditLevel::Security
        } else {
            match &decision {
                Decision::Allow => AuditLevel::Info,
                Decision::RequireConfirmation { .. } => AuditLevel::Audit,
                Decision::Deny(reason) if reason.code.is_trust_violation() => AuditLevel::Security,
                Decision::Deny(_) => AuditLevel::Warn,
            }
        };

        let mut detail = format!(
            "kind={} payload={} requested_by={} tier={} kill_switch={state}",
            request.kind,
            request.payload_descriptor,
            request.requested_by,
            tier.map_or("unknown", |t| t.as_str()),
        );
        if let Decision::Deny(reason) = &decision {
            detail.push_str("; ");
            detail.push_str(&reason.explanation);
        }
        if let Some(note) = note {
            detail.push_str("; ");
            detail.push_str(&note);
        }

        if let Err(e) = self.audit.append(
            AuditRecord::new(level, source::SAFETY_GATE, "action_evaluated")
                .detail(detail)
                .outcome(decision.outcome_label()),
        ) {
            error!(error = %e, kind = %request.kind, "gate decision not audited, denying");
            if let Decision::RequireConfirmation { token, .. } = &decision {
                self.confirmations.revoke(token);
            }
            decision = Decision::Deny(DenyReason::new(
                DenyCode::AuditUnavailable,
                format!("decision could not be recorded in the audit log: {e}"),
            ));
        }

        let counter = match &decision {
            Decision::Allow => &self.counters.allowed,
            Decision::RequireConfirmation { .. } => &self.counters.confirmations_issued,
            Decision::Deny(_) => &self.counters.denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        debug!(
            kind = %request.kind,
            outcome = %decision.outcome_label(),
            "action evaluated"
        );
        decision
    }

    fn decide(
        &self,
        request: &ActionRequest,
        halted: bool,
    ) -> (Decision, Option<SensitivityTier>, Option<String>) {
        if halted && request.kind != ActionKind::ReadOnly {
            let causes = self
                .kill_switch
                .status()
                .map(|s| {
                    s.active_causes
                        .iter()
                        .map(|c| c.cause.as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            let reason = DenyReason::new(
                DenyCode::KillSwitchTriggered,
                format!("kill switch is TRIGGERED (causes: {causes}); operator reset required"),
            );
            return (Decision::Deny(reason), None, None);
        }

        let config = match self.config.current() {
            Ok(c) => c,
            Err(e) => {
                let reason = DenyReason::new(
                    DenyCode::ForbiddenTier,
                    format!("configuration unavailable: {e}"),
                );
                return (Decision::Deny(reason), None, None);
            }
        };
        let tier = config.safety_gate.tier_for(request.kind);

        if request.kind.targets_skill() {
            let result = match self.registry.verify(&request.payload_descriptor) {
                Ok(result) => result,
                Err(RegistryError::Unaudited {
                    result: Some(result),
                    ..
                }) => *result,
                Err(e) => {
                    let reason = DenyReason::new(
                        DenyCode::UntrustedSkill,
                        format!("skill {} could not be verified: {e}", request.payload_descriptor),
                    );
                    return (Decision::Deny(reason), Some(tier), None);
                }
            };
            if let Some(reason) = result.reason() {
                let mut note = None;
                if config.kill_switch.trigger_on_untrusted_skill {
                    let cause = cause_for(reason);
                    match self.kill_switch.trigger(
                        cause,
                        &format!("skill {} {reason}", request.payload_descriptor),
                    ) {
                        Ok(_) => note = Some(format!("kill switch notified: {cause}")),
                        Err(e) => warn!(error = %e, "failed to trigger kill switch"),
                    }
                }
                let reason = DenyReason::new(
                    DenyCode::UntrustedSkill,
                    format!(
                        "skill {} is untrusted ({reason}): {}",
                        request.payload_descriptor, result.detail
                    ),
                );
                return (Decision::Deny(reason), Some(tier), note);
            }
        }

        let halted_note = halted.then(|| "read-only allowed while kill switch TRIGGERED".to_owned());

        match tier {
            SensitivityTier::Forbidden => {
                let reason = DenyReason::new(
                    DenyCode::ForbiddenTier,
                    format!("{} actions are forbidden by policy", request.kind),
                );
                (Decision::Deny(reason), Some(tier), halted_note)
            }
            SensitivityTier::ConfirmRequired => match &request.confirmation {
                Some(token) => match self.confirmations.redeem(token, &request.request_hash()) {
                    Ok(()) => (
                        Decision::Allow,
                        Some(tier),
                        Some(format!("confirmed with token {token}")),
                    ),
                    Err(code) => {
                        let explanation = match code {
                            DenyCode::ConfirmationExpired => "confirmation token expired; request a new one",
                            DenyCode::ConfirmationMismatch => "confirmation token was issued for a different request",
                            _ => "confirmation token unknown or already used",
                        };
                        (
                            Decision::Deny(DenyReason::new(code, explanation)),
                            Some(tier),
                            halted_note,
                        )
                    }
                },
                None => {
                    let ttl = chrono::Duration::from_std(config.safety_gate.confirmation_ttl())
                        .unwrap_or_else(|_| chrono::Duration::minutes(5));
                    let pending = self.confirmations.issue(request.request_hash(), ttl);
                    (
                        Decision::RequireConfirmation {
                            token: pending.token,
                            expires_at: pending.expires_at,
                        },
                        Some(tier),
                        halted_note,
                    )
                }
            },
            SensitivityTier::Safe => (Decision::Allow, Some(tier), halted_note),
        }
    }

    /// Drop expired confirmation tokens; returns how many were removed.
    pub fn gc_expired(&self) -> usize {
        self.confirmations.gc_expired()
    }

    /// Decision counters.
    pub fn stats(&self) -> GateStats {
        GateStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            confirmations_issued: self.counters.confirmations_issued.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            pending_confirmations: self.confirmations.pending_count(),
        }
    }

    /// The kill switch this gate consults.
    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }
}
