//! Tests for the built-in tasks in `src/heartbeat/tasks.rs`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use aether::audit::index::AuditIndex;
use aether::audit::{read_entries, AuditLog};
use aether::config::{Config, SharedConfig};
use aether::gate::{ActionKind, ActionRequest, SafetyGate};
use aether::heartbeat::tasks::{
    AuditChainCheck, AuditIndexUpdate, SkillIntegrityCheck, StaleStateCheck, SystemHealthCheck,
    AUDIT_CHAIN_CHECK, AUDIT_INDEX_UPDATE, SKILL_INTEGRITY_CHECK, STALE_STATE_CHECK,
    SYSTEM_HEALTH_CHECK,
};
use aether::heartbeat::{HealthReport, HeartbeatScheduler, ResourceSample, ResourceSampler, TaskStatus};
use aether::kill_switch::{AnomalyThresholds, KillSwitch, KillSwitchState, TriggerCause};
use aether::trust::{KeyStore, PatternScanner, SkillMetadata, SkillRegistry};
use chrono::Utc;

/// CPU and memory sample with plenty of free memory and no disk reading.
fn sample(cpu_percent: f64, memory_percent: f64) -> ResourceSample {
    ResourceSample {
        cpu_percent,
        memory_percent,
        memory_available_mb: 4096,
        disk_percent: None,
    }
}

/// Replays a fixed sequence of samples, repeating the last one.
struct ScriptedSampler {
    samples: Mutex<Vec<ResourceSample>>,
}

impl ScriptedSampler {
    fn constant(cpu_percent: f64, memory_percent: f64) -> Self {
        Self::fixed(sample(cpu_percent, memory_percent))
    }

    fn fixed(sample: ResourceSample) -> Self {
        Self {
            samples: Mutex::new(vec![sample]),
        }
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&self) -> anyhow::Result<ResourceSample> {
        let mut samples = self
            .samples
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?;
        if samples.len() > 1 {
            Ok(samples.remove(0))
        } else {
            samples
                .first()
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no samples"))
        }
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    config: SharedConfig,
    audit: Arc<AuditLog>,
    registry: Arc<SkillRegistry>,
    kill_switch: Arc<KillSwitch>,
    gate: Arc<SafetyGate>,
}

impl Fixture {
    fn log_path(&self) -> PathBuf {
        self.dir.path().join("audit.jsonl")
    }

    fn scheduler(&self) -> HeartbeatScheduler {
        HeartbeatScheduler::new(
            self.config.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.audit),
        )
    }

    fn count(&self, action: &str) -> usize {
        read_entries(&self.log_path())
            .expect("read log")
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).expect("audit"));
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
    let config = SharedConfig::new(Config::default());
    let gate = Arc::new(SafetyGate::new(
        config.clone(),
        Arc::clone(&kill_switch),
        Arc::clone(&registry),
        Arc::clone(&audit),
    ));
    Fixture {
        dir,
        config,
        audit,
        registry,
        kill_switch,
        gate,
    }
}

#[tokio::test]
async fn sustained_cpu_triggers_resource_anomaly() {
    let fx = fixture();
    let report_path = fx.dir.path().join("health.json");
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SystemHealthCheck::new(
        Arc::new(ScriptedSampler::constant(85.0, 40.0)),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
        &report_path,
    )));

    let t0 = Utc::now();
    for secs in [0, 30] {
        let result = scheduler
            .run_task_at(SYSTEM_HEALTH_CHECK, t0 + chrono::Duration::seconds(secs))
            .await
            .expect("run");
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(fx.kill_switch.state(), KillSwitchState::Armed);
    }

    let result = scheduler
        .run_task_at(SYSTEM_HEALTH_CHECK, t0 + chrono::Duration::seconds(61))
        .await
        .expect("run");
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert!(result.message.contains("resource anomaly"));

    assert_eq!(fx.kill_switch.state(), KillSwitchState::Triggered);
    let status = fx.kill_switch.status().expect("status");
    assert_eq!(status.active_causes.len(), 1);
    assert_eq!(status.active_causes[0].cause, TriggerCause::ResourceAnomaly);
    assert_eq!(status.active_causes[0].detail, "cpu 85.0% for 61s");
    assert_eq!(fx.count("kill_switch_triggered"), 1);

    let report: HealthReport =
        serde_json::from_slice(&std::fs::read(&report_path).expect("health file")).expect("json");
    assert_eq!(report.cpu_above_threshold_secs, 61);
    assert_eq!(report.memory_available_mb, 4096);
    assert_eq!(report.anomalies, vec!["cpu 85.0% for 61s".to_owned()]);
    assert_eq!(report.kill_switch, "triggered");
}

#[tokio::test]
async fn reloaded_thresholds_apply_to_next_sample() {
    let fx = fixture();
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SystemHealthCheck::new(
        Arc::new(ScriptedSampler::constant(60.0, 10.0)),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
        fx.dir.path().join("health.json"),
    )));

    let t0 = Utc::now();
    scheduler
        .run_task_at(SYSTEM_HEALTH_CHECK, t0)
        .await
        .expect("run");
    assert_eq!(fx.kill_switch.state(), KillSwitchState::Armed);

    let mut next = Config::default();
    next.kill_switch.cpu_threshold_percent = 50;
    next.kill_switch.cpu_duration_secs = 10;
    fx.config.reload(next, &fx.audit).expect("reload");

    for secs in [20, 120] {
        scheduler
            .run_task_at(SYSTEM_HEALTH_CHECK, t0 + chrono::Duration::seconds(secs))
            .await
            .expect("run");
    }

    assert_eq!(fx.kill_switch.state(), KillSwitchState::Triggered);
    assert_eq!(fx.kill_switch.thresholds().cpu_percent, 50.0);
    let status = fx.kill_switch.status().expect("status");
    assert_eq!(status.active_causes[0].cause, TriggerCause::ResourceAnomaly);
    assert_eq!(status.active_causes[0].detail, "cpu 60.0% for 100s");
}

#[tokio::test]
async fn sustained_disk_usage_triggers_resource_anomaly() {
    let fx = fixture();
    let report_path = fx.dir.path().join("health.json");
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SystemHealthCheck::new(
        Arc::new(ScriptedSampler::fixed(ResourceSample {
            disk_percent: Some(95.0),
            ..sample(10.0, 10.0)
        })),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
        &report_path,
    )));

    let t0 = Utc::now();
    scheduler
        .run_task_at(SYSTEM_HEALTH_CHECK, t0)
        .await
        .expect("run");
    assert_eq!(fx.kill_switch.state(), KillSwitchState::Armed);
    let report: HealthReport =
        serde_json::from_slice(&std::fs::read(&report_path).expect("health file")).expect("json");
    assert_eq!(report.disk_percent, Some(95.0));
    assert_eq!(report.anomalies, vec!["disk 95.0% for 0s".to_owned()]);

    scheduler
        .run_task_at(SYSTEM_HEALTH_CHECK, t0 + chrono::Duration::seconds(61))
        .await
        .expect("run");
    assert_eq!(fx.kill_switch.state(), KillSwitchState::Triggered);
    let status = fx.kill_switch.status().expect("status");
    assert_eq!(status.active_causes[0].detail, "disk 95.0% for 61s");
}

#[tokio::test]
async fn low_available_memory_triggers_resource_anomaly() {
    let fx = fixture();
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SystemHealthCheck::new(
        Arc::new(ScriptedSampler::fixed(ResourceSample {
            memory_available_mb: 200,
            ..sample(10.0, 50.0)
        })),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
        fx.dir.path().join("health.json"),
    )));

    let t0 = Utc::now();
    for secs in [0, 61] {
        scheduler
            .run_task_at(SYSTEM_HEALTH_CHECK, t0 + chrono::Duration::seconds(secs))
            .await
            .expect("run");
    }
    assert_eq!(fx.kill_switch.state(), KillSwitchState::Triggered);
    let status = fx.kill_switch.status().expect("status");
    assert_eq!(
        status.active_causes[0].detail,
        "200MB memory available for 61s"
    );
}

#[tokio::test]
async fn dip_below_threshold_restarts_the_window() {
    let fx = fixture();
    let sampler = ScriptedSampler {
        samples: Mutex::new(vec![
            sample(85.0, 10.0),
            sample(50.0, 10.0),
            sample(85.0, 10.0),
        ]),
    };
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SystemHealthCheck::new(
        Arc::new(sampler),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
        fx.dir.path().join("health.json"),
    )));

    let t0 = Utc::now();
    for secs in [0, 40, 70, 120] {
        scheduler
            .run_task_at(SYSTEM_HEALTH_CHECK, t0 + chrono::Duration::seconds(secs))
            .await
            .expect("run");
    }
    assert_eq!(fx.kill_switch.state(), KillSwitchState::Armed);
}

#[tokio::test]
async fn integrity_check_triggers_on_tampered_skill() {
    let fx = fixture();
    fx.registry
        .sign_and_register(
            b"def run(payload):\n    return payload\n",
            "echo",
            SkillMetadata::default(),
            false,
        )
        .expect("register");
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SkillIntegrityCheck::new(
        Arc::clone(&fx.registry),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
    )));

    let clean = scheduler.run_task(SKILL_INTEGRITY_CHECK).await.expect("run");
    assert_eq!(clean.message, "1 skills verified, 0 untrusted");
    assert_eq!(fx.kill_switch.state(), KillSwitchState::Armed);

    std::fs::write(fx.registry.source_path("echo"), b"def run(p):\n    return 1\n")
        .expect("tamper");
    let dirty = scheduler.run_task(SKILL_INTEGRITY_CHECK).await.expect("run");
    assert_eq!(dirty.status, TaskStatus::Succeeded);
    assert_eq!(dirty.message, "1 skills verified, 1 untrusted");

    let status = fx.kill_switch.status().expect("status");
    assert_eq!(
        status.active_causes[0].cause,
        TriggerCause::UnauthorizedFileAccess
    );
}

#[tokio::test]
async fn integrity_check_lists_every_untrusted_skill() {
    let fx = fixture();
    for name in ["alpha", "beta"] {
        fx.registry
            .sign_and_register(
                b"def run(payload):\n    return payload\n",
                name,
                SkillMetadata::default(),
                false,
            )
            .expect("register");
    }
    std::fs::write(fx.registry.source_path("beta"), b"def run(p):\n    return 2\n")
        .expect("tamper");
    std::fs::write(fx.registry.source_path("stray"), b"def run(p):\n    return 3\n")
        .expect("orphan");

    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SkillIntegrityCheck::new(
        Arc::clone(&fx.registry),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
    )));
    let result = scheduler.run_task(SKILL_INTEGRITY_CHECK).await.expect("run");
    assert_eq!(result.message, "3 skills verified, 2 untrusted");

    let status = fx.kill_switch.status().expect("status");
    assert_eq!(status.active_causes.len(), 1);
    let cause = &status.active_causes[0];
    assert_eq!(cause.cause, TriggerCause::UnauthorizedFileAccess);
    assert!(cause.detail.contains("beta (digest_mismatch)"), "{}", cause.detail);
    assert!(cause.detail.contains("stray (manifest_missing)"), "{}", cause.detail);
}

#[tokio::test]
async fn orphan_source_maps_to_unauthorized_file_access() {
    let fx = fixture();
    std::fs::create_dir_all(fx.dir.path().join("skills")).expect("skills dir");
    std::fs::write(fx.registry.source_path("stray"), b"print(1)\n").expect("orphan");

    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(SkillIntegrityCheck::new(
        Arc::clone(&fx.registry),
        Arc::clone(&fx.kill_switch),
        fx.config.clone(),
    )));
    scheduler.run_task(SKILL_INTEGRITY_CHECK).await.expect("run");

    let status = fx.kill_switch.status().expect("status");
    assert_eq!(
        status.active_causes[0].cause,
        TriggerCause::UnauthorizedFileAccess
    );
}

#[tokio::test]
async fn chain_check_fails_and_triggers_on_edited_log() {
    let fx = fixture();
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(AuditChainCheck::new(
        fx.log_path(),
        Arc::clone(&fx.kill_switch),
    )));

    let intact = scheduler.run_task(AUDIT_CHAIN_CHECK).await.expect("run");
    assert_eq!(intact.status, TaskStatus::Succeeded);

    let contents = std::fs::read_to_string(fx.log_path()).expect("read");
    let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    let mut first: serde_json::Value = serde_json::from_str(&lines[0]).expect("json");
    first["detail"] = serde_json::Value::String("rewritten".into());
    lines[0] = first.to_string();
    std::fs::write(fx.log_path(), format!("{}\n", lines.join("\n"))).expect("write");

    let broken = scheduler.run_task(AUDIT_CHAIN_CHECK).await.expect("run");
    assert_eq!(broken.status, TaskStatus::Failed);
    assert!(broken.message.contains("audit chain broken"));
    assert_eq!(fx.kill_switch.state(), KillSwitchState::Triggered);
}

#[tokio::test]
async fn index_update_is_gated_and_syncs() {
    let fx = fixture();
    let index = Arc::new(AuditIndex::in_memory().await.expect("index"));
    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(AuditIndexUpdate::new(
        Arc::clone(&index),
        fx.log_path(),
    )));

    let result = scheduler.run_task(AUDIT_INDEX_UPDATE).await.expect("run");
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert!(index.high_water().await.expect("hwm") > 0);

    let gate_entries = read_entries(&fx.log_path())
        .expect("read")
        .into_iter()
        .filter(|e| e.action == "action_evaluated" && e.detail.contains("kind=memory_write"))
        .count();
    assert_eq!(gate_entries, 1);
}

#[tokio::test]
async fn stale_state_check_drops_expired_tokens() {
    let fx = fixture();
    let mut next = Config::default();
    next.safety_gate.confirmation_ttl_secs = 1;
    fx.config.reload(next, &fx.audit).expect("reload");
    fx.gate
        .evaluate(&ActionRequest::new(ActionKind::FileWrite, "/tmp/a", "agent"));
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let mut scheduler = fx.scheduler();
    scheduler.register(Arc::new(StaleStateCheck::new(Arc::clone(&fx.gate))));
    let result = scheduler.run_task(STALE_STATE_CHECK).await.expect("run");
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.message, "removed 1 expired confirmations");
    assert_eq!(fx.gate.stats().pending_confirmations, 0);
    assert_eq!(fx.count("task_skipped"), 0);
}
