//! Configuration loading, validation, and atomic reload.
//!
//! Loads the control-plane configuration from `~/.aether/config.toml` (or
//! `$AETHER_CONFIG_PATH`). Environment variables override file values; file
//! values override defaults. A missing file means defaults; a malformed or
//! invalid file is rejected as a whole.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::{source, AuditLevel, AuditLog, AuditRecord};
use crate::error::{Classified, ErrorClass};
use crate::gate::{ActionKind, SensitivityTier};
use crate::heartbeat::{builtin_task_tier, TaskTier};
use crate::kill_switch::AnomalyThresholds;

/// Configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config at {path}: {source}")]
    Read {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        /// Config file.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: toml::de::Error,
    },

    /// The document parsed but violates a constraint.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// No home directory to derive default paths from.
    #[error("cannot determine home directory; set AETHER_HOME")]
    NoHomeDir,

    /// The shared config lock was poisoned.
    #[error("config lock poisoned")]
    LockPoisoned,
}

impl Classified for ConfigError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Read { .. } | Self::LockPoisoned => ErrorClass::ResourceFault,
            Self::Parse { .. } | Self::Invalid(_) | Self::NoHomeDir => {
                ErrorClass::ConfigurationFault
            }
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "config_read",
            Self::Parse { .. } => "config_parse",
            Self::Invalid(_) => "config_invalid",
            Self::NoHomeDir => "config_no_home",
            Self::LockPoisoned => "config_lock_poisoned",
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Action tiers and confirmation settings.
    pub safety_gate: SafetyGateConfig,
    /// Anomaly thresholds and trigger policy.
    pub kill_switch: KillSwitchConfig,
    /// Periodic task schedule.
    pub heartbeat: HeartbeatConfig,
    /// Skill execution settings.
    pub skills: SkillsConfig,
    /// Diagnostic logging.
    pub logging: LoggingConfig,
}

/// Optional path overrides; unset entries derive from `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// State directory (default `~/.aether`).
    pub root: Option<PathBuf>,
    /// Audit log file.
    pub audit_log: Option<PathBuf>,
    /// SQLite audit index.
    pub audit_index: Option<PathBuf>,
    /// Kill-switch state record.
    pub kill_switch_state: Option<PathBuf>,
    /// Skill sources and manifests.
    pub skills_dir: Option<PathBuf>,
    /// Signing keys (default: `<root>-keys`, a sibling outside the state tree).
    pub key_dir: Option<PathBuf>,
    /// Rotating diagnostic logs.
    pub logs_dir: Option<PathBuf>,
}

/// Fully resolved filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// State directory.
    pub root: PathBuf,
    /// Audit log file.
    pub audit_log: PathBuf,
    /// SQLite audit index.
    pub audit_index: PathBuf,
    /// Kill-switch state record.
    pub kill_switch_state: PathBuf,
    /// Skill directory.
    pub skills_dir: PathBuf,
    /// Key directory.
    pub key_dir: PathBuf,
    /// Diagnostic log directory.
    pub logs_dir: PathBuf,
    /// Latest health sample.
    pub health_report: PathBuf,
}

/// Safety gate settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyGateConfig {
    /// Confirmation token lifetime in seconds.
    pub confirmation_ttl_secs: u64,
    /// Tier per action kind; unspecified kinds keep their default.
    pub tiers: TierMap,
}

impl Default for SafetyGateConfig {
    fn default() -> Self {
        Self {
            confirmation_ttl_secs: 300,
            tiers: TierMap::default(),
        }
    }
}

impl SafetyGateConfig {
    /// Tier for `kind`.
    pub fn tier_for(&self, kind: ActionKind) -> SensitivityTier {
        self.tiers.get(kind)
    }

    /// Token lifetime.
    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.confirmation_ttl_secs)
    }
}

/// Exactly one tier for every action kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierMap {
    /// `file_write` tier.
    pub file_write: SensitivityTier,
    /// `network` tier.
    pub network: SensitivityTier,
    /// `system_command` tier.
    pub system_command: SensitivityTier,
    /// `skill_load` tier.
    pub skill_load: SensitivityTier,
    /// `skill_execute` tier.
    pub skill_execute: SensitivityTier,
    /// `read_only` tier; must be `safe`.
    pub read_only: SensitivityTier,
    /// `memory_write` tier.
    pub memory_write: SensitivityTier,
}

impl Default for TierMap {
    fn default() -> Self {
        Self {
            file_write: SensitivityTier::ConfirmRequired,
            network: SensitivityTier::ConfirmRequired,
            system_command: SensitivityTier::ConfirmRequired,
            skill_load: SensitivityTier::ConfirmRequired,
            skill_execute: SensitivityTier::ConfirmRequired,
            read_only: SensitivityTier::Safe,
            memory_write: SensitivityTier::Safe,
        }
    }
}

impl TierMap {
    /// Tier for `kind`.
    pub fn get(&self, kind: ActionKind) -> SensitivityTier {
        match kind {
            ActionKind::FileWrite => self.file_write,
            ActionKind::Network => self.network,
            ActionKind::SystemCommand => self.system_command,
            ActionKind::SkillLoad => self.skill_load,
            ActionKind::SkillExecute => self.skill_execute,
            ActionKind::ReadOnly => self.read_only,
            ActionKind::MemoryWrite => self.memory_write,
        }
    }

    /// Replace the tier for `kind`.
    pub fn set(&mut self, kind: ActionKind, tier: SensitivityTier) {
        let slot = match kind {
            ActionKind::FileWrite => &mut self.file_write,
            ActionKind::Network => &mut self.network,
            ActionKind::SystemCommand => &mut self.system_command,
            ActionKind::SkillLoad => &mut self.skill_load,
            ActionKind::SkillExecute => &mut self.skill_execute,
            ActionKind::ReadOnly => &mut self.read_only,
            ActionKind::MemoryWrite => &mut self.memory_write,
        };
        *slot = tier;
    }
}

/// Kill-switch thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KillSwitchConfig {
    /// CPU utilisation threshold, percent.
    pub cpu_threshold_percent: u8,
    /// CPU window in seconds.
    pub cpu_duration_secs: u64,
    /// Memory utilisation threshold, percent.
    pub memory_threshold_percent: u8,
    /// Memory window in seconds; also applies to low available memory.
    pub memory_duration_secs: u64,
    /// Disk utilisation threshold for the state directory, percent.
    pub disk_threshold_percent: u8,
    /// Disk window in seconds.
    pub disk_duration_secs: u64,
    /// Available memory below this many MiB counts as low memory.
    pub min_available_memory_mb: u64,
    /// Trigger when the gate sees an untrusted skill.
    pub trigger_on_untrusted_skill: bool,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 80,
            cpu_duration_secs: 60,
            memory_threshold_percent: 90,
            memory_duration_secs: 60,
            disk_threshold_percent: 90,
            disk_duration_secs: 60,
            min_available_memory_mb: 500,
            trigger_on_untrusted_skill: true,
        }
    }
}

impl KillSwitchConfig {
    /// Thresholds in the form the kill switch consumes.
    pub fn thresholds(&self) -> AnomalyThresholds {
        AnomalyThresholds {
            cpu_percent: f64::from(self.cpu_threshold_percent),
            cpu_window: Duration::from_secs(self.cpu_duration_secs),
            memory_percent: f64::from(self.memory_threshold_percent),
            memory_window: Duration::from_secs(self.memory_duration_secs),
            disk_percent: f64::from(self.disk_threshold_percent),
            disk_window: Duration::from_secs(self.disk_duration_secs),
            min_available_memory_mb: self.min_available_memory_mb,
        }
    }
}

/// One scheduled heartbeat task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatTaskConfig {
    /// Built-in task name.
    pub name: String,
    /// Seconds between runs.
    pub interval_secs: u64,
    /// Whether the task mutates shared state.
    pub tier: TaskTier,
    /// Disabled tasks never run.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl HeartbeatTaskConfig {
    /// Run interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Per-task execution limit in seconds.
    pub task_timeout_secs: u64,
    /// Longest idle sleep between scheduling passes.
    pub max_sleep_secs: u64,
    /// Task schedule.
    pub tasks: Vec<HeartbeatTaskConfig>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        let task = |name: &str, interval_secs: u64, tier: TaskTier| HeartbeatTaskConfig {
            name: name.to_owned(),
            interval_secs,
            tier,
            enabled: true,
        };
        Self {
            task_timeout_secs: 120,
            max_sleep_secs: 60,
            tasks: vec![
                task("skill_integrity_check", 1800, TaskTier::ReadOnly),
                task("system_health_check", 30, TaskTier::ReadOnly),
                task("audit_chain_check", 3600, TaskTier::ReadOnly),
                task("audit_index_update", 300, TaskTier::ReadWrite),
                task("stale_state_check", 600, TaskTier::ReadWrite),
            ],
        }
    }
}

impl HeartbeatConfig {
    /// Per-task execution limit.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Longest idle sleep.
    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs(self.max_sleep_secs)
    }
}

/// Skill execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkillsConfig {
    /// Interpreter command.
    pub interpreter: String,
    /// Arguments placed before the source is piped in. Empty selects the
    /// built-in Python bootstrap.
    pub interpreter_args: Vec<String>,
    /// Execution limit in seconds.
    pub execution_timeout_secs: u64,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_owned(),
            interpreter_args: Vec::new(),
            execution_timeout_secs: 30,
        }
    }
}

impl SkillsConfig {
    /// Execution limit.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load with precedence env vars > file > defaults, then validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable, malformed, or
    /// invalid.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = config_path_with(&env)?;
        let mut config = Self::load_file(&path)?;
        config.apply_overrides(&env);
        config.validate()?;
        Ok(config)
    }

    /// Read `path`; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides.
    ///
    /// Takes a resolver function for testability (avoids `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("AETHER_HOME") {
            self.paths.root = Some(PathBuf::from(v));
        }
        if let Some(v) = env("AETHER_AUDIT_LOG") {
            self.paths.audit_log = Some(PathBuf::from(v));
        }
        if let Some(v) = env("AETHER_KEY_DIR") {
            self.paths.key_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("AETHER_SKILLS_DIR") {
            self.paths.skills_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("AETHER_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Check every constraint; nothing is applied when this fails.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.safety_gate.tier_for(ActionKind::ReadOnly) != SensitivityTier::Safe {
            return invalid("safety_gate.tiers.read_only must be safe".to_owned());
        }
        if self.safety_gate.confirmation_ttl_secs == 0 {
            return invalid("safety_gate.confirmation_ttl_secs must be positive".to_owned());
        }

        let ks = &self.kill_switch;
        for (field, pct) in [
            ("cpu_threshold_percent", ks.cpu_threshold_percent),
            ("memory_threshold_percent", ks.memory_threshold_percent),
            ("disk_threshold_percent", ks.disk_threshold_percent),
        ] {
            if !(1..=100).contains(&pct) {
                return invalid(format!("kill_switch.{field} must be within 1..=100"));
            }
        }
        if ks.cpu_duration_secs == 0 || ks.memory_duration_secs == 0 || ks.disk_duration_secs == 0
        {
            return invalid("kill_switch durations must be positive".to_owned());
        }

        let hb = &self.heartbeat;
        if hb.task_timeout_secs == 0 || hb.max_sleep_secs == 0 {
            return invalid("heartbeat timeouts must be positive".to_owned());
        }
        let mut seen = HashSet::new();
        for task in &hb.tasks {
            if !seen.insert(task.name.as_str()) {
                return invalid(format!("heartbeat task {} is listed twice", task.name));
            }
            let Some(builtin_tier) = builtin_task_tier(&task.name) else {
                return invalid(format!("unknown heartbeat task {}", task.name));
            };
            if builtin_tier == TaskTier::ReadWrite && task.tier == TaskTier::ReadOnly {
                return invalid(format!(
                    "heartbeat task {} mutates state and cannot be read_only",
                    task.name
                ));
            }
            if task.interval_secs == 0 {
                return invalid(format!("heartbeat task {} needs a positive interval", task.name));
            }
        }

        if self.skills.interpreter.trim().is_empty() {
            return invalid("skills.interpreter must not be empty".to_owned());
        }
        if self.skills.execution_timeout_secs == 0 {
            return invalid("skills.execution_timeout_secs must be positive".to_owned());
        }
        if self.logging.level.trim().is_empty() {
            return invalid("logging.level must not be empty".to_owned());
        }
        Ok(())
    }

    /// Resolve every filesystem location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDir`] when no root is configured and the
    /// home directory cannot be found.
    pub fn runtime_paths(&self) -> Result<RuntimePaths, ConfigError> {
        let root = match &self.paths.root {
            Some(root) => root.clone(),
            None => home_dir()?.join(".aether"),
        };
        let default_key_dir = {
            let mut name = root
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| ".aether".into());
            name.push("-keys");
            root.with_file_name(name)
        };
        let p = &self.paths;
        Ok(RuntimePaths {
            audit_log: p
                .audit_log
                .clone()
                .unwrap_or_else(|| root.join("audit_log.jsonl")),
            audit_index: p
                .audit_index
                .clone()
                .unwrap_or_else(|| root.join("audit_index.db")),
            kill_switch_state: p
                .kill_switch_state
                .clone()
                .unwrap_or_else(|| root.join("kill_switch.json")),
            skills_dir: p.skills_dir.clone().unwrap_or_else(|| root.join("skills")),
            key_dir: p.key_dir.clone().unwrap_or(default_key_dir),
            logs_dir: p.logs_dir.clone().unwrap_or_else(|| root.join("logs")),
            health_report: root.join("health.json"),
            root,
        })
    }
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    let base = directories::BaseDirs::new().ok_or(ConfigError::NoHomeDir)?;
    Ok(base.home_dir().to_path_buf())
}

/// Resolve the config file path using an env resolver.
///
/// # Errors
///
/// Returns [`ConfigError::NoHomeDir`] when neither `AETHER_CONFIG_PATH` nor
/// a home directory is available.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf, ConfigError> {
    if let Some(p) = env("AETHER_CONFIG_PATH") {
        return Ok(PathBuf::from(p));
    }
    if let Some(root) = env("AETHER_HOME") {
        return Ok(PathBuf::from(root).join("config.toml"));
    }
    Ok(home_dir()?.join(".aether").join("config.toml"))
}

/// Configuration shared across components, replaced atomically on reload.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    /// Wrap an already validated config.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot of the current config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::LockPoisoned`] if a writer panicked.
    pub fn current(&self) -> Result<Arc<Config>, ConfigError> {
        let guard = self.inner.read().map_err(|_| ConfigError::LockPoisoned)?;
        Ok(Arc::clone(&guard))
    }

    /// Validate `next`, swap it in, and audit the tier changes.
    ///
    /// Returns a description of each changed tier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] (and changes nothing) when `next`
    /// fails validation.
    pub fn reload(&self, next: Config, audit: &AuditLog) -> Result<Vec<String>, ConfigError> {
        next.validate()?;
        let next = Arc::new(next);
        let previous = {
            let mut guard = self.inner.write().map_err(|_| ConfigError::LockPoisoned)?;
            std::mem::replace(&mut *guard, Arc::clone(&next))
        };

        let changes: Vec<String> = ActionKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let before = previous.safety_gate.tier_for(kind);
                let after = next.safety_gate.tier_for(kind);
                (before != after).then(|| format!("{kind}: {before} -> {after}"))
            })
            .collect();

        let detail = if changes.is_empty() {
            "no tier changes".to_owned()
        } else {
            format!("tier changes: {}", changes.join(", "))
        };
        if let Err(e) = audit.append(
            AuditRecord::new(AuditLevel::Audit, source::CONFIG, "config_reloaded")
                .detail(detail)
                .outcome("applied"),
        ) {
            tracing::warn!(error = %e, "failed to audit log config reload");
        }
        tracing::info!(changes = changes.len(), "configuration reloaded");
        Ok(changes)
    }
}
