//! Tests for `src/gate/`: tiers, confirmation tokens, and kill-switch
//! enforcement.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aether::audit::{read_entries, AuditLevel, AuditLog};
use aether::config::{Config, SharedConfig};
use aether::gate::{ActionKind, ActionRequest, Decision, DenyCode, SafetyGate, SensitivityTier};
use aether::kill_switch::{AnomalyThresholds, KillSwitch, TriggerCause};
use aether::trust::{KeyStore, PatternScanner, SkillMetadata, SkillRegistry};

struct Fixture {
    _dir: tempfile::TempDir,
    log_path: PathBuf,
    audit: Arc<AuditLog>,
    config: SharedConfig,
    kill_switch: Arc<KillSwitch>,
    registry: Arc<SkillRegistry>,
    gate: SafetyGate,
}

fn fixture(config: Config) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("audit.jsonl");
    let audit = Arc::new(AuditLog::open(&log_path).expect("audit"));
    let mut keys = KeyStore::open(dir.path().join("keys"), Arc::clone(&audit)).expect("keys");
    keys.generate().expect("generate");
    let registry = Arc::new(
        SkillRegistry::new(
            dir.path().join("skills"),
            Arc::new(keys),
            Box::new(PatternScanner::new()),
            Arc::clone(&audit),
        )
        .expect("registry"),
    );
    let kill_switch = Arc::new(KillSwitch::in_memory(
        Arc::clone(&audit),
        AnomalyThresholds::default(),
    ));
    kill_switch.arm().expect("arm");
    let config = SharedConfig::new(config);
    let gate = SafetyGate::new(
        config.clone(),
        Arc::clone(&kill_switch),
        Arc::clone(&registry),
        Arc::clone(&audit),
    );
    Fixture {
        _dir: dir,
        log_path,
        audit,
        config,
        kill_switch,
        registry,
        gate,
    }
}

fn gate_entries(fx: &Fixture) -> Vec<(AuditLevel, Option<String>)> {
    read_entries(&fx.log_path)
        .expect("read log")
        .into_iter()
        .filter(|e| e.action == "action_evaluated")
        .map(|e| (e.level, e.outcome))
        .collect()
}

fn token_of(decision: Decision) -> String {
    match decision {
        Decision::RequireConfirmation { token, .. } => token,
        other => panic!("expected RequireConfirmation, got {other:?}"),
    }
}

#[test]
fn confirm_required_then_allowed_with_token() {
    let fx = fixture(Config::default());
    let request = ActionRequest::new(ActionKind::FileWrite, "/tmp/report.txt", "agent");

    let token = token_of(fx.gate.evaluate(&request));
    assert_eq!(token.len(), 8);

    let confirmed = request.clone().with_confirmation(&token);
    assert_eq!(fx.gate.evaluate(&confirmed), Decision::Allow);

    assert_eq!(
        fx.gate.evaluate(&confirmed).deny_code(),
        Some(DenyCode::ConfirmationInvalid),
        "tokens are single use"
    );
}

#[test]
fn expired_token_is_denied() {
    let mut config = Config::default();
    config.safety_gate.confirmation_ttl_secs = 1;
    let fx = fixture(config);
    let request = ActionRequest::new(ActionKind::Network, "https://example.com", "agent");

    let token = token_of(fx.gate.evaluate(&request));
    std::thread::sleep(Duration::from_millis(1100));

    let decision = fx.gate.evaluate(&request.with_confirmation(token));
    assert_eq!(decision.deny_code(), Some(DenyCode::ConfirmationExpired));
}

#[test]
fn token_for_another_request_is_mismatch_and_stays_valid() {
    let fx = fixture(Config::default());
    let original = ActionRequest::new(ActionKind::SystemCommand, "ls /", "agent");
    let other = ActionRequest::new(ActionKind::SystemCommand, "rm -rf /", "agent");

    let token = token_of(fx.gate.evaluate(&original));
    assert_eq!(
        fx.gate.evaluate(&other.with_confirmation(&token)).deny_code(),
        Some(DenyCode::ConfirmationMismatch)
    );
    assert!(fx.gate.evaluate(&original.with_confirmation(token)).is_allow());
}

#[test]
fn unknown_token_is_invalid() {
    let fx = fixture(Config::default());
    let request = ActionRequest::new(ActionKind::FileWrite, "/tmp/x", "agent")
        .with_confirmation("ZZZZZZZZ");
    assert_eq!(
        fx.gate.evaluate(&request).deny_code(),
        Some(DenyCode::ConfirmationInvalid)
    );
}

#[test]
fn forbidden_tier_is_denied_and_safe_tier_allowed() {
    let mut config = Config::default();
    config
        .safety_gate
        .tiers
        .set(ActionKind::Network, SensitivityTier::Forbidden);
    let fx = fixture(config);

    let decision = fx
        .gate
        .evaluate(&ActionRequest::new(ActionKind::Network, "https://example.com", "agent"));
    assert_eq!(decision.deny_code(), Some(DenyCode::ForbiddenTier));

    let decision = fx
        .gate
        .evaluate(&ActionRequest::new(ActionKind::MemoryWrite, "index", "heartbeat"));
    assert!(decision.is_allow());

    let levels: Vec<AuditLevel> = gate_entries(&fx).into_iter().map(|(l, _)| l).collect();
    assert_eq!(levels, vec![AuditLevel::Warn, AuditLevel::Info]);
}

#[test]
fn triggered_switch_denies_all_but_read_only() {
    let fx = fixture(Config::default());
    fx.kill_switch
        .trigger(TriggerCause::ExplicitStopCommand, "operator stop")
        .expect("trigger");

    for kind in ActionKind::ALL {
        let decision = fx.gate.evaluate(&ActionRequest::new(kind, "target", "agent"));
        if kind == ActionKind::ReadOnly {
            assert!(decision.is_allow(), "read_only must stay allowed");
        } else {
            assert_eq!(
                decision.deny_code(),
                Some(DenyCode::KillSwitchTriggered),
                "{kind} must be denied"
            );
        }
    }

    assert!(gate_entries(&fx)
        .iter()
        .all(|(level, _)| *level == AuditLevel::Security));
}

#[test]
fn every_evaluation_writes_exactly_one_gate_entry() {
    let fx = fixture(Config::default());
    fx.registry
        .sign_and_register(
            b"def run(payload):\n    return payload\n",
            "echo",
            SkillMetadata::default(),
            false,
        )
        .expect("register");

    let requests = [
        ActionRequest::new(ActionKind::ReadOnly, "/etc/hosts", "agent"),
        ActionRequest::new(ActionKind::FileWrite, "/tmp/out", "agent"),
        ActionRequest::new(ActionKind::SkillExecute, "echo", "agent"),
        ActionRequest::new(ActionKind::SkillLoad, "missing", "agent"),
        ActionRequest::new(ActionKind::FileWrite, "/tmp/out", "agent").with_confirmation("bogus"),
    ];
    for request in &requests {
        fx.gate.evaluate(request);
    }

    let outcomes: Vec<Option<String>> = gate_entries(&fx).into_iter().map(|(_, o)| o).collect();
    assert_eq!(
        outcomes,
        vec![
            Some("allow".to_owned()),
            Some("require_confirmation".to_owned()),
            Some("require_confirmation".to_owned()),
            Some("deny:untrusted_skill".to_owned()),
            Some("deny:kill_switch_triggered".to_owned()),
        ]
    );

    let stats = fx.gate.stats();
    assert_eq!(stats.allowed, 1);
    assert_eq!(stats.confirmations_issued, 2);
    assert_eq!(stats.denied, 2);
    assert_eq!(stats.pending_confirmations, 2);
}

#[test]
fn reload_changes_tiers_for_later_requests() {
    let fx = fixture(Config::default());
    let request = ActionRequest::new(ActionKind::FileWrite, "/tmp/out", "agent");
    assert!(matches!(
        fx.gate.evaluate(&request),
        Decision::RequireConfirmation { .. }
    ));

    let mut next = Config::default();
    next.safety_gate
        .tiers
        .set(ActionKind::FileWrite, SensitivityTier::Safe);
    let changes = fx.config.reload(next, &fx.audit).expect("reload");
    assert_eq!(changes, vec!["file_write: confirm_required -> safe".to_owned()]);

    assert!(fx.gate.evaluate(&request).is_allow());
}

#[test]
fn expired_tokens_are_collected() {
    let mut config = Config::default();
    config.safety_gate.confirmation_ttl_secs = 1;
    let fx = fixture(config);
    fx.gate
        .evaluate(&ActionRequest::new(ActionKind::FileWrite, "/tmp/a", "agent"));
    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(fx.gate.gc_expired(), 1);
    assert_eq!(fx.gate.stats().pending_confirmations, 0);
}

/// Audit sink whose every write fails.
struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::other("audit volume unavailable"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn unrecorded_decision_is_denied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let audit = Arc::new(AuditLog::from_writer(Box::new(FailingWriter)));
    let keys = KeyStore::open(dir.path().join("keys"), Arc::clone(&audit)).expect("keys");
    let registry = Arc::new(
        SkillRegistry::new(
            dir.path().join("skills"),
            Arc::new(keys),
            Box::new(PatternScanner::new()),
            Arc::clone(&audit),
        )
        .expect("registry"),
    );
    let kill_switch = Arc::new(KillSwitch::in_memory(
        Arc::clone(&audit),
        AnomalyThresholds::default(),
    ));
    let mut config = Config::default();
    config
        .safety_gate
        .tiers
        .set(ActionKind::Network, SensitivityTier::Safe);
    let gate = SafetyGate::new(
        SharedConfig::new(config),
        kill_switch,
        registry,
        Arc::clone(&audit),
    );
    let seq_before = audit.next_seq().expect("seq");

    let safe = gate.evaluate(&ActionRequest::new(ActionKind::Network, "https://example.com", "agent"));
    assert_eq!(safe.deny_code(), Some(DenyCode::AuditUnavailable));

    let confirm = gate.evaluate(&ActionRequest::new(ActionKind::FileWrite, "/tmp/a", "agent"));
    assert_eq!(confirm.deny_code(), Some(DenyCode::AuditUnavailable));

    let stats = gate.stats();
    assert_eq!(stats.allowed, 0);
    assert_eq!(stats.confirmations_issued, 0);
    assert_eq!(stats.denied, 2);
    assert_eq!(stats.pending_confirmations, 0);
    assert_eq!(audit.next_seq().expect("seq"), seq_before);
}
