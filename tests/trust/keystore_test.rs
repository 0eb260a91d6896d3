//! Tests for `src/trust/keystore.rs`.

use std::path::Path;
use std::sync::Arc;

use aether::audit::{read_entries, AuditLevel, AuditLog};
use aether::trust::keystore::{PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};
use aether::trust::{KeyError, KeyStore};

fn audit(dir: &Path) -> Arc<AuditLog> {
    Arc::new(AuditLog::open(dir.join("audit.jsonl")).expect("audit"))
}

#[test]
fn signatures_verify_and_any_bit_flip_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut keys = KeyStore::open(dir.path().join("keys"), audit(dir.path())).expect("open");
    keys.generate().expect("generate");

    let payload = b"aether-skill:v1:echo:1.0.0:abcdef".to_vec();
    let signature = keys.sign(&payload).expect("sign");
    assert_eq!(signature.len(), 64);
    assert!(keys.verify(&payload, &signature).expect("verify"));

    for bit in 0..signature.len() * 8 {
        let mut mutated = signature.clone();
        mutated[bit / 8] ^= 1 << (bit % 8);
        assert!(
            !keys.verify(&payload, &mutated).expect("well-formed"),
            "signature bit {bit} flip still verified"
        );
    }

    for bit in 0..payload.len() * 8 {
        let mut mutated = payload.clone();
        mutated[bit / 8] ^= 1 << (bit % 8);
        assert!(
            !keys.verify(&mutated, &signature).expect("well-formed"),
            "payload bit {bit} flip still verified"
        );
    }
}

#[test]
fn keys_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_dir = dir.path().join("keys");
    let log = audit(dir.path());

    let (fingerprint, signature) = {
        let mut keys = KeyStore::open(&key_dir, Arc::clone(&log)).expect("open");
        let info = keys.generate().expect("generate");
        (info.fingerprint, keys.sign(b"hello").expect("sign"))
    };

    let keys = KeyStore::open(&key_dir, log).expect("reopen");
    assert_eq!(keys.fingerprint().as_deref(), Some(fingerprint.as_str()));
    assert!(keys.verify(b"hello", &signature).expect("verify"));
}

#[test]
fn public_key_alone_verifies_but_cannot_sign() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_dir = dir.path().join("keys");
    let log = audit(dir.path());

    let signature = {
        let mut keys = KeyStore::open(&key_dir, Arc::clone(&log)).expect("open");
        keys.generate().expect("generate");
        keys.sign(b"payload").expect("sign")
    };
    std::fs::remove_file(key_dir.join(PRIVATE_KEY_FILE)).expect("remove private");

    let keys = KeyStore::open(&key_dir, log).expect("reopen");
    assert!(keys.verify(b"payload", &signature).expect("verify"));
    assert!(matches!(keys.sign(b"x"), Err(KeyError::KeyUnavailable)));
    assert!(!keys.info().expect("info").can_sign);
}

#[cfg(unix)]
#[test]
fn private_key_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let key_dir = dir.path().join("keys");
    let mut keys = KeyStore::open(&key_dir, audit(dir.path())).expect("open");
    keys.generate().expect("generate");

    let mode = std::fs::metadata(key_dir.join(PRIVATE_KEY_FILE))
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
    let dir_mode = std::fs::metadata(&key_dir)
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o077, 0);
    assert!(key_dir.join(PUBLIC_KEY_FILE).exists());
}

#[cfg(unix)]
#[test]
fn world_readable_private_key_is_refused() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let key_dir = dir.path().join("keys");
    let log = audit(dir.path());
    {
        let mut keys = KeyStore::open(&key_dir, Arc::clone(&log)).expect("open");
        keys.generate().expect("generate");
    }
    std::fs::set_permissions(
        key_dir.join(PRIVATE_KEY_FILE),
        std::fs::Permissions::from_mode(0o644),
    )
    .expect("chmod");

    let err = KeyStore::open(&key_dir, log).expect_err("must refuse");
    assert!(matches!(err, KeyError::InsecurePermissions { .. }));
}

#[test]
fn destroy_requires_matching_fingerprint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_dir = dir.path().join("keys");
    let log = audit(dir.path());
    let mut keys = KeyStore::open(&key_dir, Arc::clone(&log)).expect("open");
    let info = keys.generate().expect("generate");

    assert!(matches!(
        keys.destroy("not-the-fingerprint"),
        Err(KeyError::ConfirmationMismatch)
    ));
    assert!(key_dir.join(PRIVATE_KEY_FILE).exists());

    keys.destroy(&info.fingerprint).expect("destroy");
    assert!(!key_dir.join(PRIVATE_KEY_FILE).exists());
    assert!(keys.fingerprint().is_none());

    let entries = read_entries(&dir.path().join("audit.jsonl")).expect("read");
    let destroyed = entries
        .iter()
        .find(|e| e.action == "key_destroyed")
        .expect("destroy audited");
    assert_eq!(destroyed.level, AuditLevel::Security);
}

#[test]
fn private_key_never_logged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_dir = dir.path().join("keys");
    let mut keys = KeyStore::open(&key_dir, audit(dir.path())).expect("open");
    keys.generate().expect("generate");
    keys.sign(b"payload").expect("sign");

    let private_hex = std::fs::read_to_string(key_dir.join(PRIVATE_KEY_FILE)).expect("read key");
    let log = std::fs::read_to_string(dir.path().join("audit.jsonl")).expect("read log");
    assert!(!log.contains(private_hex.trim()));
    assert!(!format!("{keys:?}").contains(private_hex.trim()));
}
