//! Kill-switch states, trigger causes, and the persisted record.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage;

/// Global autonomy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchState {
    /// Not yet armed.
    Disarmed,
    /// Monitoring active, actions flow through the gate.
    Armed,
    /// Halted; non-read-only actions are denied until an operator reset.
    Triggered,
    /// Transient state while a reset confirmation is checked.
    ResetPending,
}

impl KillSwitchState {
    /// snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disarmed => "disarmed",
            Self::Armed => "armed",
            Self::Triggered => "triggered",
            Self::ResetPending => "reset_pending",
        }
    }

    /// Whether non-read-only actions must be denied.
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Triggered | Self::ResetPending)
    }
}

impl fmt::Display for KillSwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the switch was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    /// A skill without a manifest was about to run.
    UnsignedSkillExecution,
    /// A skill signature did not verify.
    SignatureVerificationFailure,
    /// A signed file or the audit log changed without authorisation.
    UnauthorizedFileAccess,
    /// An operator asked to stop.
    ExplicitStopCommand,
    /// Sustained CPU or memory pressure.
    ResourceAnomaly,
}

impl TriggerCause {
    /// Every cause.
    pub const ALL: [TriggerCause; 5] = [
        Self::UnsignedSkillExecution,
        Self::SignatureVerificationFailure,
        Self::UnauthorizedFileAccess,
        Self::ExplicitStopCommand,
        Self::ResourceAnomaly,
    ];

    /// snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsignedSkillExecution => "unsigned_skill_execution",
            Self::SignatureVerificationFailure => "signature_verification_failure",
            Self::UnauthorizedFileAccess => "unauthorized_file_access",
            Self::ExplicitStopCommand => "explicit_stop_command",
            Self::ResourceAnomaly => "resource_anomaly",
        }
    }

    /// Parse a snake_case name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseRecord {
    /// Cause.
    pub cause: TriggerCause,
    /// Free-form detail from the caller.
    pub detail: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// One successful operator reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRecord {
    /// When the reset completed.
    pub at: DateTime<Utc>,
    /// Number of causes active at reset time.
    pub causes_cleared: usize,
}

/// Durable kill-switch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedKillSwitch {
    /// Current state.
    pub state: KillSwitchState,
    /// Every trigger ever recorded, oldest first.
    #[serde(default)]
    pub causes: Vec<CauseRecord>,
    /// Every reset, oldest first.
    #[serde(default)]
    pub resets: Vec<ResetRecord>,
}

impl Default for PersistedKillSwitch {
    fn default() -> Self {
        Self {
            state: KillSwitchState::Disarmed,
            causes: Vec::new(),
            resets: Vec::new(),
        }
    }
}

impl PersistedKillSwitch {
    /// Causes recorded since the last reset.
    pub fn active_causes(&self) -> Vec<CauseRecord> {
        let since = self.resets.last().map(|r| r.at);
        self.causes
            .iter()
            .filter(|c| since.map_or(true, |s| c.at > s))
            .cloned()
            .collect()
    }

    /// Load from `path`. A missing file yields the default record; a
    /// persisted `reset_pending` is read back as `triggered`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file exists but cannot be read, or an
    /// `InvalidData` error when it cannot be parsed.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        let mut record: Self = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if record.state == KillSwitchState::ResetPending {
            record.state = KillSwitchState::Triggered;
        }
        Ok(record)
    }

    /// Write atomically to `path`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from the atomic write.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        storage::write_atomic(path, &bytes)
    }
}
