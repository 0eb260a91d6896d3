//! Tests for `src/config.rs`: layering, validation, and reload.

use std::path::PathBuf;

use aether::audit::{read_entries, AuditLevel, AuditLog};
use aether::config::{config_path_with, Config, ConfigError, SharedConfig};
use aether::gate::{ActionKind, SensitivityTier};
use aether::heartbeat::TaskTier;

fn env_from(pairs: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
    move |key| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }
}

#[test]
fn file_values_override_defaults_and_env_overrides_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
[safety_gate]
confirmation_ttl_secs = 60

[safety_gate.tiers]
network = "forbidden"

[logging]
level = "warn"
"#,
    )
    .expect("write config");

    let env = env_from(vec![
        ("AETHER_CONFIG_PATH", config_path.display().to_string()),
        ("AETHER_HOME", dir.path().join("state").display().to_string()),
        ("AETHER_LOG_LEVEL", "debug".to_owned()),
    ]);
    let config = Config::load_with(env).expect("load");

    assert_eq!(config.safety_gate.confirmation_ttl_secs, 60);
    assert_eq!(
        config.safety_gate.tier_for(ActionKind::Network),
        SensitivityTier::Forbidden
    );
    assert_eq!(
        config.safety_gate.tier_for(ActionKind::FileWrite),
        SensitivityTier::ConfirmRequired,
        "unspecified kinds keep their default"
    );
    assert_eq!(config.logging.level, "debug");
    assert_eq!(
        config.runtime_paths().expect("paths").root,
        dir.path().join("state")
    );
}

#[test]
fn missing_file_means_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = env_from(vec![(
        "AETHER_CONFIG_PATH",
        dir.path().join("absent.toml").display().to_string(),
    )]);
    let config = Config::load_with(env).expect("load");
    assert_eq!(config, Config::default());
}

#[test]
fn malformed_file_is_rejected_whole() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[safety_gate\nconfirmation_ttl_secs = ").expect("write");
    let env = env_from(vec![("AETHER_CONFIG_PATH", config_path.display().to_string())]);
    assert!(matches!(
        Config::load_with(env),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn unknown_keys_are_rejected() {
    let err = Config::from_toml("[safety_gate]\nconfirmation_ttl = 5\n").expect_err("unknown key");
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn invalid_values_are_rejected() {
    let cases = [
        "[safety_gate]\nconfirmation_ttl_secs = 0\n",
        "[kill_switch]\ncpu_threshold_percent = 0\n",
        "[kill_switch]\nmemory_threshold_percent = 101\n",
        "[heartbeat]\ntask_timeout_secs = 0\n",
        "[[heartbeat.tasks]]\nname = \"defragment\"\ninterval_secs = 60\ntier = \"read_only\"\n",
        "[[heartbeat.tasks]]\nname = \"audit_index_update\"\ninterval_secs = 60\ntier = \"read_only\"\n",
        "[[heartbeat.tasks]]\nname = \"audit_chain_check\"\ninterval_secs = 0\ntier = \"read_only\"\n",
        "[skills]\ninterpreter = \" \"\n",
    ];
    for case in cases {
        assert!(
            matches!(Config::from_toml(case), Err(ConfigError::Invalid(_))),
            "accepted invalid config:\n{case}"
        );
    }
}

#[test]
fn heartbeat_schedule_can_be_replaced() {
    let config = Config::from_toml(
        r#"
[[heartbeat.tasks]]
name = "system_health_check"
interval_secs = 5
tier = "read_only"

[[heartbeat.tasks]]
name = "audit_chain_check"
interval_secs = 60
tier = "read_write"
enabled = false
"#,
    )
    .expect("parse");
    let tasks = &config.heartbeat.tasks;
    assert_eq!(tasks.len(), 2);
    assert!(tasks[0].enabled);
    assert_eq!(tasks[1].tier, TaskTier::ReadWrite);
    assert!(!tasks[1].enabled);
}

#[test]
fn config_path_resolution() {
    let explicit = config_path_with(env_from(vec![(
        "AETHER_CONFIG_PATH",
        "/etc/aether.toml".to_owned(),
    )]))
    .expect("path");
    assert_eq!(explicit, PathBuf::from("/etc/aether.toml"));

    let under_home = config_path_with(env_from(vec![("AETHER_HOME", "/srv/aether".to_owned())]))
        .expect("path");
    assert_eq!(under_home, PathBuf::from("/srv/aether/config.toml"));
}

#[test]
fn explicit_paths_win_over_root() {
    let config = Config::from_toml(
        r#"
[paths]
root = "/var/lib/aether"
key_dir = "/secure/keys"
"#,
    )
    .expect("parse");
    let paths = config.runtime_paths().expect("paths");
    assert_eq!(paths.key_dir, PathBuf::from("/secure/keys"));
    assert_eq!(paths.skills_dir, PathBuf::from("/var/lib/aether/skills"));
    assert_eq!(
        paths.kill_switch_state,
        PathBuf::from("/var/lib/aether/kill_switch.json")
    );
}

#[test]
fn reload_swaps_atomically_and_audits_tier_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("audit.jsonl");
    let audit = AuditLog::open(&log_path).expect("audit");
    let shared = SharedConfig::new(Config::default());

    let mut next = Config::default();
    next.safety_gate
        .tiers
        .set(ActionKind::SystemCommand, SensitivityTier::Forbidden);
    let changes = shared.reload(next, &audit).expect("reload");
    assert_eq!(
        changes,
        vec!["system_command: confirm_required -> forbidden".to_owned()]
    );
    assert_eq!(
        shared
            .current()
            .expect("current")
            .safety_gate
            .tier_for(ActionKind::SystemCommand),
        SensitivityTier::Forbidden
    );

    let mut invalid = Config::default();
    invalid
        .safety_gate
        .tiers
        .set(ActionKind::ReadOnly, SensitivityTier::Forbidden);
    assert!(shared.reload(invalid, &audit).is_err());
    assert_eq!(
        shared
            .current()
            .expect("current")
            .safety_gate
            .tier_for(ActionKind::ReadOnly),
        SensitivityTier::Safe,
        "rejected reload changes nothing"
    );

    let entries = read_entries(&log_path).expect("read");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "config_reloaded");
    assert_eq!(entries[0].level, AuditLevel::Audit);
    assert!(entries[0].detail.contains("system_command"));
}
