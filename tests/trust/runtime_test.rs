//! Tests for `src/trust/runtime.rs`, using `sh` as a stand-in interpreter.

use std::sync::Arc;
use std::time::Duration;

use aether::audit::AuditLog;
use aether::trust::{
    ExecutableHandle, KeyStore, PatternScanner, ProcessRuntime, RuntimeError, SkillEntry,
    SkillMetadata, SkillRegistry, SkillRuntime,
};
use serde_json::json;

fn handle(dir: &std::path::Path, source: &[u8]) -> ExecutableHandle {
    let audit = Arc::new(AuditLog::from_writer(Box::new(std::io::sink())));
    let mut keys = KeyStore::open(dir.join("keys"), Arc::clone(&audit)).expect("keys");
    keys.generate().expect("generate");
    let registry = SkillRegistry::new(
        dir.join("skills"),
        Arc::new(keys),
        Box::new(PatternScanner::new()),
        audit,
    )
    .expect("registry");
    registry
        .sign_and_register(source, "fixture", SkillMetadata::default(), false)
        .expect("register");
    registry.load_for_execution("fixture").expect("load")
}

fn sh(script: &str, timeout: Duration) -> ProcessRuntime {
    ProcessRuntime::new("sh", vec!["-c".to_owned(), script.to_owned()], timeout)
}

#[cfg(unix)]
#[tokio::test]
async fn entry_and_input_reach_the_interpreter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = handle(dir.path(), b"verified source\n");
    let runtime = sh(
        r#"src=$(cat); printf '{"entry":"%s","input":%s,"source":"%s"}' "$AETHER_SKILL_ENTRY" "$AETHER_SKILL_INPUT" "$src""#,
        Duration::from_secs(10),
    );

    let output = runtime
        .invoke(&handle, SkillEntry::Run, json!({"n": 3}))
        .await
        .expect("invoke");
    assert_eq!(
        output,
        json!({"entry": "run", "input": {"n": 3}, "source": "verified source"})
    );
}

#[cfg(unix)]
#[tokio::test]
async fn non_json_output_is_returned_as_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = handle(dir.path(), b"x = 1\n");
    let runtime = sh("cat >/dev/null; echo plain words", Duration::from_secs(10));

    let output = runtime
        .invoke(&handle, SkillEntry::Describe, serde_json::Value::Null)
        .await
        .expect("invoke");
    assert_eq!(output, json!("plain words"));
}

#[cfg(unix)]
#[tokio::test]
async fn failing_skill_reports_exit_code_and_stderr() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = handle(dir.path(), b"x = 1\n");
    let runtime = sh("cat >/dev/null; echo boom >&2; exit 4", Duration::from_secs(10));

    let err = runtime
        .invoke(&handle, SkillEntry::Run, serde_json::Value::Null)
        .await
        .expect_err("must fail");
    match err {
        RuntimeError::Failed { code, stderr, .. } => {
            assert_eq!(code, Some(4));
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn slow_skill_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = handle(dir.path(), b"x = 1\n");
    let runtime = sh("sleep 5", Duration::from_millis(200));

    let err = runtime
        .invoke(&handle, SkillEntry::Run, serde_json::Value::Null)
        .await
        .expect_err("must time out");
    assert!(matches!(err, RuntimeError::TimedOut { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn interpreter_ignoring_stdin_still_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut source = b"# padding\n".to_vec();
    source.extend(std::iter::repeat(b'x').take(512 * 1024));
    source.push(b'\n');
    let handle = handle(dir.path(), &source);
    let runtime = sh("sleep 5", Duration::from_millis(300));

    let started = std::time::Instant::now();
    let err = runtime
        .invoke(&handle, SkillEntry::Run, serde_json::Value::Null)
        .await
        .expect_err("must time out");
    assert!(matches!(err, RuntimeError::TimedOut { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn missing_interpreter_is_a_spawn_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = handle(dir.path(), b"x = 1\n");
    let runtime = ProcessRuntime::new(
        "/nonexistent/aether-interpreter",
        Vec::new(),
        Duration::from_secs(1),
    );

    let err = runtime
        .invoke(&handle, SkillEntry::Run, serde_json::Value::Null)
        .await
        .expect_err("must fail");
    assert!(matches!(err, RuntimeError::Spawn { .. }));
}
