//! Global halt for autonomous operation.
//!
//! The [`KillSwitch`] is a single owned object shared by handle. Transitions
//! are check-and-set under one lock, persisted atomically, broadcast through
//! a `watch` channel, and written to the audit log. A TRIGGERED switch
//! survives restarts and only an operator reset with an out-of-band
//! challenge code returns it to ARMED.

pub mod signal;
pub mod state;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::{source, AuditLevel, AuditLog, AuditRecord};
use crate::error::{Classified, ErrorClass};

pub use signal::{is_trigger_condition, AnomalySignal, AnomalyThresholds, SustainedTracker};
pub use state::{CauseRecord, KillSwitchState, PersistedKillSwitch, ResetRecord, TriggerCause};

/// How long a reset challenge code stays valid.
const CHALLENGE_TTL_MINUTES: i64 = 10;

/// Length of a reset challenge code.
const CHALLENGE_LEN: usize = 8;

/// Alphabet for challenge codes; no look-alike characters.
const CHALLENGE_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Kill-switch failures.
#[derive(Debug, thiserror::Error)]
pub enum KillSwitchError {
    /// The requested operation is not valid from the current state.
    #[error("cannot {operation} while kill switch is {state}")]
    InvalidTransition {
        /// Operation attempted.
        operation: &'static str,
        /// State at the time.
        state: KillSwitchState,
    },

    /// The reset confirmation did not match an outstanding challenge.
    #[error("reset confirmation rejected: {0}")]
    InvalidConfirmation(String),

    /// The state record could not be read or written.
    #[error("kill switch state I/O error on {path}: {source}")]
    Persist {
        /// State file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The state lock was poisoned.
    #[error("kill switch lock poisoned")]
    LockPoisoned,
}

impl Classified for KillSwitchError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidTransition { .. } | Self::InvalidConfirmation(_) => {
                ErrorClass::PolicyDenial
            }
            Self::Persist { .. } | Self::LockPoisoned => ErrorClass::ResourceFault,
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidConfirmation(_) => "invalid_confirmation",
            Self::Persist { .. } => "kill_switch_persist",
            Self::LockPoisoned => "kill_switch_lock_poisoned",
        }
    }
}

/// Outstanding operator reset challenge. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetChallenge {
    /// Code the operator must echo back.
    pub code: String,
    /// When the code stops being accepted.
    pub expires_at: DateTime<Utc>,
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillSwitchStatus {
    /// Current state.
    pub state: KillSwitchState,
    /// Causes since the last reset.
    pub active_causes: Vec<CauseRecord>,
    /// Total triggers recorded.
    pub total_triggers: usize,
    /// Last reset, if any.
    pub last_reset: Option<ResetRecord>,
}

struct Inner {
    record: PersistedKillSwitch,
    challenge: Option<ResetChallenge>,
}

/// The process-wide kill switch.
pub struct KillSwitch {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    audit: Arc<AuditLog>,
    thresholds: RwLock<AnomalyThresholds>,
    tx: watch::Sender<KillSwitchState>,
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("state", &self.state())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl KillSwitch {
    /// Load the persisted switch at `path` (DISARMED when absent).
    ///
    /// # Errors
    ///
    /// Returns [`KillSwitchError::Persist`] when the record exists but cannot
    /// be read or parsed.
    pub fn open(
        path: impl Into<PathBuf>,
        audit: Arc<AuditLog>,
        thresholds: AnomalyThresholds,
    ) -> Result<Self, KillSwitchError> {
        let path = path.into();
        let record = PersistedKillSwitch::load(&path).map_err(|source| KillSwitchError::Persist {
            path: path.clone(),
            source,
        })?;
        if record.state == KillSwitchState::Triggered {
            warn!(
                causes = record.active_causes().len(),
                "kill switch resumed in TRIGGERED state"
            );
        }
        Ok(Self::from_record(record, Some(path), audit, thresholds))
    }

    /// Non-persistent switch starting DISARMED.
    pub fn in_memory(audit: Arc<AuditLog>, thresholds: AnomalyThresholds) -> Self {
        Self::from_record(PersistedKillSwitch::default(), None, audit, thresholds)
    }

    fn from_record(
        record: PersistedKillSwitch,
        path: Option<PathBuf>,
        audit: Arc<AuditLog>,
        thresholds: AnomalyThresholds,
    ) -> Self {
        let (tx, _rx) = watch::channel(record.state);
        Self {
            inner: Mutex::new(Inner {
                record,
                challenge: None,
            }),
            path,
            audit,
            thresholds: RwLock::new(thresholds),
            tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> KillSwitchState {
        *self.tx.borrow()
    }

    /// Whether non-read-only actions must be denied.
    pub fn is_triggered(&self) -> bool {
        self.state().is_halted()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<KillSwitchState> {
        self.tx.subscribe()
    }

    /// Thresholds used by [`is_trigger_condition`](Self::is_trigger_condition).
    pub fn thresholds(&self) -> AnomalyThresholds {
        *self.thresholds.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the thresholds, e.g. after a config reload.
    pub fn set_thresholds(&self, thresholds: AnomalyThresholds) {
        let mut current = self.thresholds.write().unwrap_or_else(PoisonError::into_inner);
        if *current != thresholds {
            info!(?thresholds, "kill switch thresholds updated");
            *current = thresholds;
        }
    }

    /// Whether `signal` is a trigger condition under this switch's thresholds.
    pub fn is_trigger_condition(&self, signal: &AnomalySignal) -> bool {
        is_trigger_condition(signal, &self.thresholds())
    }

    /// Status snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`KillSwitchError::LockPoisoned`] if a transition panicked.
    pub fn status(&self) -> Result<KillSwitchStatus, KillSwitchError> {
        let inner = self.inner.lock().map_err(|_| KillSwitchError::LockPoisoned)?;
        Ok(KillSwitchStatus {
            state: inner.record.state,
            active_causes: inner.record.active_causes(),
            total_triggers: inner.record.causes.len(),
            last_reset: inner.record.resets.last().cloned(),
        })
    }

    fn persist(&self, record: &PersistedKillSwitch) -> Result<(), KillSwitchError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        record.save(path).map_err(|source| KillSwitchError::Persist {
            path: path.clone(),
            source,
        })
    }

    fn publish(&self, state: KillSwitchState) {
        self.tx.send_replace(state);
    }

    /// Arm the switch. Valid only from DISARMED.
    ///
    /// # Errors
    ///
    /// Returns [`KillSwitchError::InvalidTransition`] from any other state.
    pub fn arm(&self) -> Result<(), KillSwitchError> {
        let mut inner = self.inner.lock().map_err(|_| KillSwitchError::LockPoisoned)?;
        let current = inner.record.state;
        if current != KillSwitchState::Disarmed {
            return Err(KillSwitchError::InvalidTransition {
                operation: "arm",
                state: current,
            });
        }

        let mut next = inner.record.clone();
        next.state = KillSwitchState::Armed;
        self.persist(&next)?;
        inner.record = next;
        self.publish(KillSwitchState::Armed);
        drop(inner);

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Audit, source::KILL_SWITCH, "kill_switch_armed")
                .detail("monitoring enabled")
                .outcome("armed"),
        ) {
            warn!(error = %e, "failed to audit log kill switch arm");
        }
        info!("kill switch armed");
        Ok(())
    }

    /// Trigger the switch.
    ///
    /// Valid from ARMED, and from DISARMED as well (an unarmed switch still
    /// halts). Returns `Ok(false)` without changing anything when already
    /// halted; the duplicate is logged at WARN.
    ///
    /// The in-memory state moves to TRIGGERED even if persisting fails; the
    /// persistence failure is then returned.
    ///
    /// # Errors
    ///
    /// Returns [`KillSwitchError::Persist`] when the new state could not be
    /// written.
    pub fn trigger(&self, cause: TriggerCause, detail: &str) -> Result<bool, KillSwitchError> {
        let mut inner = self.inner.lock().map_err(|_| KillSwitchError::LockPoisoned)?;
        let current = inner.record.state;
        if current.is_halted() {
            drop(inner);
            if let Err(e) = self.audit.append(
                AuditRecord::new(AuditLevel::Warn, source::KILL_SWITCH, "kill_switch_duplicate_trigger")
                    .detail(format!("cause={cause} detail={detail}; already {current}"))
                    .outcome("ignored"),
            ) {
                warn!(error = %e, "failed to audit log duplicate trigger");
            }
            return Ok(false);
        }

        inner.record.state = KillSwitchState::Triggered;
        inner.record.causes.push(CauseRecord {
            cause,
            detail: detail.to_owned(),
            at: Utc::now(),
        });
        inner.challenge = None;
        self.publish(KillSwitchState::Triggered);
        let persisted = self.persist(&inner.record);
        drop(inner);

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Security, source::KILL_SWITCH, "kill_switch_triggered")
                .detail(format!("cause={cause} from={current} detail={detail}"))
                .outcome("triggered"),
        ) {
            error!(error = %e, "failed to audit log kill switch trigger");
        }
        error!(cause = %cause, detail, "kill switch TRIGGERED");

        if let Err(e) = persisted {
            error!(error = %e, "failed to persist triggered kill switch state");
            return Err(e);
        }
        Ok(true)
    }

    /// Issue a one-time reset code. Valid only while TRIGGERED.
    ///
    /// The code is held in memory only and expires after ten minutes; a
    /// new challenge replaces any earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`KillSwitchError::InvalidTransition`] when not TRIGGERED.
    pub fn reset_challenge(&self) -> Result<ResetChallenge, KillSwitchError> {
        let mut inner = self.inner.lock().map_err(|_| KillSwitchError::LockPoisoned)?;
        let current = inner.record.state;
        if current != KillSwitchState::Triggered {
            return Err(KillSwitchError::InvalidTransition {
                operation: "issue reset challenge",
                state: current,
            });
        }
        let now = Utc::now();
        let challenge = ResetChallenge {
            code: generate_challenge_code(),
            expires_at: now
                .checked_add_signed(Duration::minutes(CHALLENGE_TTL_MINUTES))
                .unwrap_or(now),
        };
        inner.challenge = Some(challenge.clone());
        drop(inner);

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Audit, source::KILL_SWITCH, "reset_challenge_issued")
                .detail(format!("expires_at={}", challenge.expires_at.to_rfc3339()))
                .outcome("pending"),
        ) {
            warn!(error = %e, "failed to audit log reset challenge");
        }
        Ok(challenge)
    }

    /// Operator reset. Valid only from TRIGGERED.
    ///
    /// Moves through RESET_PENDING while `confirmation` is checked against
    /// the outstanding challenge. On success the switch is ARMED and exactly
    /// one SECURITY entry with the cause history is written; on failure it
    /// stays TRIGGERED. The challenge is consumed either way.
    ///
    /// # Errors
    ///
    /// Returns [`KillSwitchError::InvalidTransition`] when not TRIGGERED,
    /// [`KillSwitchError::InvalidConfirmation`] when the code is wrong or
    /// expired, or [`KillSwitchError::Persist`] when the reset cannot be
    /// written (the switch then stays TRIGGERED).
    pub fn request_reset(&self, confirmation: &str) -> Result<(), KillSwitchError> {
        let mut inner = self.inner.lock().map_err(|_| KillSwitchError::LockPoisoned)?;
        let current = inner.record.state;
        if current != KillSwitchState::Triggered {
            return Err(KillSwitchError::InvalidTransition {
                operation: "reset",
                state: current,
            });
        }

        inner.record.state = KillSwitchState::ResetPending;
        self.publish(KillSwitchState::ResetPending);

        let challenge = inner.challenge.take();
        let rejection = match &challenge {
            None => Some("no reset challenge outstanding"),
            Some(c) if Utc::now() >= c.expires_at => Some("reset challenge expired"),
            Some(c) if !codes_match(&c.code, confirmation) => Some("confirmation code mismatch"),
            Some(_) => None,
        };

        if let Some(why) = rejection {
            inner.record.state = KillSwitchState::Triggered;
            self.publish(KillSwitchState::Triggered);
            drop(inner);
            if let Err(e) = self.audit.append(
                AuditRecord::new(AuditLevel::Warn, source::KILL_SWITCH, "kill_switch_reset_rejected")
                    .detail(why)
                    .outcome("triggered"),
            ) {
                warn!(error = %e, "failed to audit log rejected reset");
            }
            warn!(reason = why, "kill switch reset rejected");
            return Err(KillSwitchError::InvalidConfirmation(why.to_owned()));
        }

        let active = inner.record.active_causes();
        let mut next = inner.record.clone();
        next.state = KillSwitchState::Armed;
        next.resets.push(ResetRecord {
            at: Utc::now(),
            causes_cleared: active.len(),
        });
        if let Err(e) = self.persist(&next) {
            inner.record.state = KillSwitchState::Triggered;
            self.publish(KillSwitchState::Triggered);
            return Err(e);
        }
        inner.record = next;
        self.publish(KillSwitchState::Armed);
        drop(inner);

        let history = active
            .iter()
            .map(|c| format!("{}@{} ({})", c.cause, c.at.to_rfc3339(), c.detail))
            .collect::<Vec<_>>()
            .join("; ");
        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Security, source::KILL_SWITCH, "kill_switch_reset")
                .detail(format!("operator reset; causes cleared: [{history}]"))
                .outcome("armed"),
        ) {
            error!(error = %e, "failed to audit log kill switch reset");
        }
        info!(causes_cleared = active.len(), "kill switch reset by operator");
        Ok(())
    }
}

fn codes_match(expected: &str, given: &str) -> bool {
    let given = given.trim().to_ascii_uppercase();
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn generate_challenge_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CHALLENGE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHALLENGE_CHARS.len());
            char::from(CHALLENGE_CHARS.get(idx).copied().unwrap_or(b'A'))
        })
        .collect()
}
