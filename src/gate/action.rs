//! Action requests and the decisions the gate returns for them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Category of a requested action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Writing to the filesystem.
    FileWrite,
    /// Outbound network access.
    Network,
    /// Running a shell command.
    SystemCommand,
    /// Loading a skill.
    SkillLoad,
    /// Executing a skill.
    SkillExecute,
    /// Reading without side effects.
    ReadOnly,
    /// Internal state or index maintenance.
    MemoryWrite,
}

impl ActionKind {
    /// Every kind, in declaration order.
    pub const ALL: [ActionKind; 7] = [
        Self::FileWrite,
        Self::Network,
        Self::SystemCommand,
        Self::SkillLoad,
        Self::SkillExecute,
        Self::ReadOnly,
        Self::MemoryWrite,
    ];

    /// snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileWrite => "file_write",
            Self::Network => "network",
            Self::SystemCommand => "system_command",
            Self::SkillLoad => "skill_load",
            Self::SkillExecute => "skill_execute",
            Self::ReadOnly => "read_only",
            Self::MemoryWrite => "memory_write",
        }
    }

    /// Parse a snake_case name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Whether the payload names a skill that must be verified.
    pub fn targets_skill(&self) -> bool {
        matches!(self, Self::SkillLoad | Self::SkillExecute)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much autonomy risk an action kind carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityTier {
    /// Allowed without confirmation.
    Safe,
    /// Needs an operator confirmation token.
    ConfirmRequired,
    /// Never allowed.
    Forbidden,
}

impl SensitivityTier {
    /// snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::ConfirmRequired => "confirm_required",
            Self::Forbidden => "forbidden",
        }
    }
}

impl fmt::Display for SensitivityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to perform a sensitive action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    /// Action category.
    pub kind: ActionKind,
    /// What the action targets (path, URL, command, skill name).
    pub payload_descriptor: String,
    /// Who is asking.
    pub requested_by: String,
    /// When the request was made.
    pub timestamp: DateTime<Utc>,
    /// Token from an earlier `RequireConfirmation`, when resubmitting.
    pub confirmation: Option<String>,
}

impl ActionRequest {
    /// New request stamped with the current time.
    pub fn new(kind: ActionKind, payload: impl Into<String>, requested_by: impl Into<String>) -> Self {
        Self {
            kind,
            payload_descriptor: payload.into(),
            requested_by: requested_by.into(),
            timestamp: Utc::now(),
            confirmation: None,
        }
    }

    /// Attach a confirmation token.
    #[must_use]
    pub fn with_confirmation(mut self, token: impl Into<String>) -> Self {
        self.confirmation = Some(token.into());
        self
    }

    /// Hash binding a confirmation token to this request's identity.
    pub fn request_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.kind.as_str(),
            self.payload_descriptor.as_str(),
            self.requested_by.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Machine-readable deny reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    /// The kill switch is TRIGGERED.
    KillSwitchTriggered,
    /// The target skill failed verification.
    UntrustedSkill,
    /// The action kind is FORBIDDEN.
    ForbiddenTier,
    /// The confirmation token outlived its TTL.
    ConfirmationExpired,
    /// The confirmation token is unknown or already used.
    ConfirmationInvalid,
    /// The token was issued for a different request.
    ConfirmationMismatch,
    /// The decision could not be written to the audit log.
    AuditUnavailable,
}

impl DenyCode {
    /// snake_case code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KillSwitchTriggered => "kill_switch_triggered",
            Self::UntrustedSkill => "untrusted_skill",
            Self::ForbiddenTier => "forbidden_tier",
            Self::ConfirmationExpired => "confirmation_expired",
            Self::ConfirmationInvalid => "confirmation_invalid",
            Self::ConfirmationMismatch => "confirmation_mismatch",
            Self::AuditUnavailable => "audit_unavailable",
        }
    }

    /// Whether the denial reflects a trust violation rather than policy.
    pub fn is_trust_violation(&self) -> bool {
        matches!(self, Self::UntrustedSkill)
    }
}

impl fmt::Display for DenyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason attached to a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenyReason {
    /// Machine-readable code.
    pub code: DenyCode,
    /// Human-readable explanation.
    pub explanation: String,
}

impl DenyReason {
    /// Build a reason.
    pub fn new(code: DenyCode, explanation: impl Into<String>) -> Self {
        Self {
            code,
            explanation: explanation.into(),
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.explanation)
    }
}

/// Outcome of [`SafetyGate::evaluate`](super::SafetyGate::evaluate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed.
    Allow,
    /// Obtain operator approval, then resubmit with `token`.
    RequireConfirmation {
        /// Single-use token bound to the request.
        token: String,
        /// When the token stops being accepted.
        expires_at: DateTime<Utc>,
    },
    /// Refused.
    Deny(DenyReason),
}

impl Decision {
    /// Whether the action may proceed now.
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Deny code, if denied.
    pub fn deny_code(&self) -> Option<DenyCode> {
        match self {
            Self::Deny(reason) => Some(reason.code),
            _ => None,
        }
    }

    /// Short outcome label for audit entries (`allow`, `require_confirmation`,
    /// `deny:<code>`).
    pub fn outcome_label(&self) -> String {
        match self {
            Self::Allow => "allow".to_owned(),
            Self::RequireConfirmation { .. } => "require_confirmation".to_owned(),
            Self::Deny(reason) => format!("deny:{}", reason.code),
        }
    }
}
