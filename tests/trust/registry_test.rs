//! Tests for `src/trust/registry.rs`.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use aether::audit::{read_entries, AuditLevel, AuditLog};
use aether::config::{Config, SharedConfig};
use aether::gate::{ActionKind, ActionRequest, DenyCode, SafetyGate};
use aether::kill_switch::{AnomalyThresholds, KillSwitch, KillSwitchState, TriggerCause};
use aether::trust::{
    KeyStore, PatternScanner, RegistryError, SkillMetadata, SkillRegistry, TrustStatus,
    UntrustedReason,
};

const ECHO: &[u8] = b"def run(payload):\n    return payload\n";

struct Fixture {
    _dir: tempfile::TempDir,
    log_path: std::path::PathBuf,
    audit: Arc<AuditLog>,
    registry: Arc<SkillRegistry>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("audit.jsonl");
    let audit = Arc::new(AuditLog::open(&log_path).expect("audit"));
    let mut keys = KeyStore::open(dir.path().join("keys"), Arc::clone(&audit)).expect("keys");
    keys.generate().expect("generate");
    let registry = SkillRegistry::new(
        dir.path().join("skills"),
        Arc::new(keys),
        Box::new(PatternScanner::new()),
        Arc::clone(&audit),
    )
    .expect("registry");
    Fixture {
        _dir: dir,
        log_path,
        audit,
        registry: Arc::new(registry),
    }
}

/// Audit sink whose every write fails, as on a full disk.
struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::other("no space left on device"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn registry_with_failing_audit(dir: &Path) -> SkillRegistry {
    let audit = Arc::new(AuditLog::from_writer(Box::new(FailingWriter)));
    let mut keys = KeyStore::open(dir.join("keys"), Arc::clone(&audit)).expect("keys");
    keys.generate().expect("generate");
    SkillRegistry::new(
        dir.join("skills"),
        Arc::new(keys),
        Box::new(PatternScanner::new()),
        audit,
    )
    .expect("registry")
}

fn register(registry: &SkillRegistry, name: &str, source: &[u8]) {
    registry
        .sign_and_register(source, name, SkillMetadata::default(), false)
        .expect("register");
}

fn actions(log_path: &Path) -> Vec<(AuditLevel, String)> {
    read_entries(log_path)
        .expect("read log")
        .into_iter()
        .map(|e| (e.level, e.action))
        .collect()
}

#[test]
fn signed_skill_verifies_as_trusted() {
    let fx = fixture();
    let manifest = fx
        .registry
        .sign_and_register(
            ECHO,
            "echo",
            SkillMetadata {
                version: "2.1.0".to_owned(),
                description: "returns its input".to_owned(),
                author: "ops".to_owned(),
            },
            false,
        )
        .expect("register");
    assert_eq!(manifest.version, "2.1.0");
    assert!(manifest.security_scan_result.passed);

    let result = fx.registry.verify("echo").expect("verify");
    assert_eq!(result.status, TrustStatus::Trusted);

    let handle = fx.registry.load_for_execution("echo").expect("load");
    assert_eq!(handle.source(), ECHO);
    assert_eq!(handle.version(), "2.1.0");
    assert_eq!(handle.digest(), manifest.content_digest);
}

#[test]
fn edited_source_is_digest_mismatch_and_never_loads() {
    let fx = fixture();
    register(&fx.registry, "echo", ECHO);

    let path = fx.registry.source_path("echo");
    let mut bytes = fs::read(&path).expect("read source");
    bytes.push(b'\n');
    fs::write(&path, bytes).expect("edit source");

    let result = fx.registry.verify("echo").expect("verify");
    assert_eq!(result.reason(), Some(UntrustedReason::DigestMismatch));

    let err = fx
        .registry
        .load_for_execution("echo")
        .expect_err("tampered skill must not load");
    assert!(matches!(
        err,
        RegistryError::UntrustedSkill {
            reason: UntrustedReason::DigestMismatch,
            ..
        }
    ));

    let logged = actions(&fx.log_path);
    assert!(logged
        .iter()
        .any(|(level, action)| *level == AuditLevel::Security && action == "skill_untrusted"));
    assert!(!logged.iter().any(|(_, action)| action == "skill_loaded"));
}

#[test]
fn gate_denies_tampered_skill_and_triggers_kill_switch() {
    let fx = fixture();
    register(&fx.registry, "echo", ECHO);
    fs::write(
        fx.registry.source_path("echo"),
        b"def run(payload):\n    return 'owned'\n",
    )
    .expect("edit source");

    let kill_switch = Arc::new(KillSwitch::in_memory(
        Arc::clone(&fx.audit),
        AnomalyThresholds::default(),
    ));
    kill_switch.arm().expect("arm");
    let gate = SafetyGate::new(
        SharedConfig::new(Config::default()),
        Arc::clone(&kill_switch),
        Arc::clone(&fx.registry),
        Arc::clone(&fx.audit),
    );

    let decision = gate.evaluate(&ActionRequest::new(ActionKind::SkillExecute, "echo", "agent"));
    assert_eq!(decision.deny_code(), Some(DenyCode::UntrustedSkill));

    assert_eq!(kill_switch.state(), KillSwitchState::Triggered);
    let status = kill_switch.status().expect("status");
    assert_eq!(
        status.active_causes[0].cause,
        TriggerCause::UnauthorizedFileAccess
    );
}

#[test]
fn duplicate_name_needs_overwrite() {
    let fx = fixture();
    register(&fx.registry, "echo", ECHO);

    let err = fx
        .registry
        .sign_and_register(ECHO, "echo", SkillMetadata::default(), false)
        .expect_err("duplicate");
    assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "echo"));

    let replacement = b"def run(payload):\n    return [payload]\n";
    fx.registry
        .sign_and_register(replacement, "echo", SkillMetadata::default(), true)
        .expect("overwrite");
    assert!(fx.registry.verify("echo").expect("verify").is_trusted());
    assert_eq!(
        fx.registry.load_for_execution("echo").expect("load").source(),
        replacement
    );
}

#[test]
fn scan_rejection_stores_nothing_and_is_audited() {
    let fx = fixture();
    let source = b"import os\n\ndef run(payload):\n    os.system(payload)\n";

    let err = fx
        .registry
        .sign_and_register(source, "shell", SkillMetadata::default(), false)
        .expect_err("must be rejected");
    match err {
        RegistryError::ScanRejected { name, summary } => {
            assert_eq!(name, "shell");
            assert!(summary.contains("shell_spawn"), "summary: {summary}");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(!fx.registry.source_path("shell").exists());
    assert!(!fx.registry.manifest_path("shell").exists());
    assert!(actions(&fx.log_path)
        .iter()
        .any(|(level, action)| *level == AuditLevel::Security && action == "skill_scan_rejected"));
}

#[test]
fn missing_files_have_distinct_reasons() {
    let fx = fixture();
    register(&fx.registry, "gone", ECHO);
    fs::remove_file(fx.registry.source_path("gone")).expect("remove source");
    assert_eq!(
        fx.registry.verify("gone").expect("verify").reason(),
        Some(UntrustedReason::SourceMissing)
    );

    fs::write(fx.registry.source_path("stray"), ECHO).expect("write stray");
    assert_eq!(
        fx.registry.verify("stray").expect("verify").reason(),
        Some(UntrustedReason::ManifestMissing)
    );
}

#[test]
fn manifest_for_another_name_is_signature_invalid() {
    let fx = fixture();
    register(&fx.registry, "alpha", ECHO);
    register(&fx.registry, "beta", ECHO);

    fs::copy(
        fx.registry.manifest_path("alpha"),
        fx.registry.manifest_path("beta"),
    )
    .expect("swap manifest");
    assert_eq!(
        fx.registry.verify("beta").expect("verify").reason(),
        Some(UntrustedReason::SignatureInvalid)
    );
}

#[test]
fn verify_all_reports_every_skill() {
    let fx = fixture();
    register(&fx.registry, "alpha", ECHO);
    register(&fx.registry, "beta", ECHO);
    register(&fx.registry, "gamma", ECHO);
    fs::write(fx.registry.source_path("beta"), b"tampered").expect("tamper");

    let results = fx.registry.verify_all().expect("verify all");
    let summary: Vec<(&str, bool)> = results
        .iter()
        .map(|r| (r.name.as_str(), r.is_trusted()))
        .collect();
    assert_eq!(
        summary,
        vec![("alpha", true), ("beta", false), ("gamma", true)]
    );

    let logged = actions(&fx.log_path);
    assert!(logged
        .iter()
        .any(|(level, action)| *level == AuditLevel::Security && action == "skills_verified"));
}

#[test]
fn list_and_remove() {
    let fx = fixture();
    register(&fx.registry, "alpha", ECHO);
    register(&fx.registry, "beta", ECHO);

    let names: Vec<String> = fx
        .registry
        .list()
        .expect("list")
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    fx.registry.remove("alpha").expect("remove");
    assert_eq!(fx.registry.names().expect("names"), vec!["beta"]);
    assert!(matches!(
        fx.registry.remove("alpha"),
        Err(RegistryError::NotFound(_))
    ));
    assert!(actions(&fx.log_path)
        .iter()
        .any(|(_, action)| action == "skill_removed"));
}

#[test]
fn unrecorded_trust_violation_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_failing_audit(dir.path());
    registry
        .sign_and_register(ECHO, "echo", SkillMetadata::default(), false)
        .expect("register despite audit failure");
    assert!(registry.verify("echo").expect("verify").is_trusted());

    fs::write(registry.source_path("echo"), b"def run(p):\n    return 0\n").expect("tamper");
    match registry.verify("echo") {
        Err(RegistryError::Unaudited {
            name,
            violation,
            result: Some(result),
            ..
        }) => {
            assert_eq!(name, "echo");
            assert_eq!(violation, "digest_mismatch");
            assert_eq!(result.reason(), Some(UntrustedReason::DigestMismatch));
        }
        other => panic!("unexpected verification outcome: {other:?}"),
    }
    assert!(matches!(
        registry.load_for_execution("echo"),
        Err(RegistryError::Unaudited { .. })
    ));

    let results = registry.verify_all().expect("verify all");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reason(), Some(UntrustedReason::DigestMismatch));
}

#[test]
fn unrecorded_scan_rejection_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry_with_failing_audit(dir.path());
    let source = b"import os\n\ndef run(payload):\n    os.system(payload)\n";

    let err = registry
        .sign_and_register(source, "shell", SkillMetadata::default(), false)
        .expect_err("must be rejected");
    assert!(
        matches!(err, RegistryError::Unaudited { ref violation, result: None, .. } if violation == "scan_rejected"),
        "{err}"
    );
    assert!(!registry.source_path("shell").exists());
    assert!(!registry.manifest_path("shell").exists());
}

#[test]
fn concurrent_overwrite_never_reads_a_torn_pair() {
    let fx = fixture();
    register(&fx.registry, "echo", ECHO);
    let sources: [&[u8]; 2] = [
        b"def run(payload):\n    return payload\n",
        b"def run(payload):\n    return [payload, payload]\n",
    ];
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for i in 0..100usize {
                fx.registry
                    .sign_and_register(sources[i % 2], "echo", SkillMetadata::default(), true)
                    .expect("overwrite");
            }
            done.store(true, Ordering::SeqCst);
        });

        let mut checked = 0usize;
        while !done.load(Ordering::SeqCst) || checked == 0 {
            let result = fx.registry.verify("echo").expect("verify");
            assert!(result.is_trusted(), "verdict during overwrite: {result:?}");
            checked += 1;
        }
        writer.join().expect("writer thread");
    });

    assert!(!actions(&fx.log_path)
        .iter()
        .any(|(_, action)| action == "skill_untrusted"));
}

#[test]
fn concurrent_registration_of_one_name_admits_exactly_one() {
    let fx = fixture();
    let threads = 8;
    let barrier = Barrier::new(threads);

    let outcomes: Vec<Result<(), RegistryError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    fx.registry
                        .sign_and_register(ECHO, "race", SkillMetadata::default(), false)
                        .map(|_| ())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect()
    });

    let admitted = outcomes.iter().filter(|o| o.is_ok()).count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, Err(RegistryError::DuplicateName(n)) if n == "race"))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(duplicates, threads - 1);
    assert_eq!(
        actions(&fx.log_path)
            .iter()
            .filter(|(_, action)| action == "skill_signed")
            .count(),
        1
    );
    assert!(fx.registry.verify("race").expect("verify").is_trusted());
}
