//! Interval scheduling and isolated task execution.
//!
//! Tasks run one after another. Each run is bounded by the configured task
//! timeout, isolated in its own tokio task so an error or panic becomes a
//! [`TaskResult`], and audited with exactly one entry.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::{source, AuditLevel, AuditLog, AuditRecord};
use crate::config::{HeartbeatTaskConfig, SharedConfig};
use crate::gate::{ActionKind, ActionRequest, Decision, SafetyGate};

use super::{HeartbeatTask, TaskContext, TaskResult, TaskStatus, TaskTier};

/// Completed runs kept for `status`.
const HISTORY_CAP: usize = 100;

/// Shortest sleep between scheduling passes.
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Tracks last-run timestamps for scheduled tasks.
#[derive(Debug, Default)]
pub struct SchedulerState {
    last_run: HashMap<String, DateTime<Utc>>,
}

impl SchedulerState {
    /// Create a new scheduler state with no recorded runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a task was executed at the given time.
    pub fn record_run(&mut self, name: &str, at: DateTime<Utc>) {
        self.last_run.insert(name.to_owned(), at);
    }

    /// Get the last run time for a task.
    pub fn last_run_for(&self, name: &str) -> Option<&DateTime<Utc>> {
        self.last_run.get(name)
    }

    /// When `task` next becomes due; `None` means it has never run.
    fn next_due_for(&self, task: &HeartbeatTaskConfig) -> Option<DateTime<Utc>> {
        let last = self.last_run_for(&task.name)?;
        let due = chrono::Duration::from_std(task.interval())
            .ok()
            .and_then(|interval| last.checked_add_signed(interval));
        Some(due.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

/// Check which tasks are due for execution at `now`.
///
/// A task is due if it is enabled and has either never run or last ran at
/// least one interval ago.
pub fn due_tasks<'a>(
    tasks: &'a [HeartbeatTaskConfig],
    state: &SchedulerState,
    now: DateTime<Utc>,
) -> Vec<&'a HeartbeatTaskConfig> {
    tasks
        .iter()
        .filter(|task| task.enabled)
        .filter(|task| state.next_due_for(task).map_or(true, |due| due <= now))
        .collect()
}

/// Earliest time any enabled task becomes due.
fn next_due(
    tasks: &[HeartbeatTaskConfig],
    state: &SchedulerState,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    tasks
        .iter()
        .filter(|task| task.enabled)
        .map(|task| state.next_due_for(task).unwrap_or(now))
        .min()
}

/// How long the loop sleeps: until the next due task, or `max_sleep` when
/// no task is enabled.
fn sleep_for(until_due: Option<Duration>, max_sleep: Duration) -> Duration {
    let ceiling = max_sleep.max(MIN_SLEEP);
    until_due.map_or(ceiling, |d| d.clamp(MIN_SLEEP, ceiling))
}

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Last run time per task.
    pub last_runs: BTreeMap<String, DateTime<Utc>>,
    /// Most recent results, oldest first.
    pub recent: Vec<TaskResult>,
}

/// Runs registered heartbeat tasks on their configured intervals.
pub struct HeartbeatScheduler {
    tasks: HashMap<&'static str, Arc<dyn HeartbeatTask>>,
    config: SharedConfig,
    gate: Arc<SafetyGate>,
    audit: Arc<AuditLog>,
    state: tokio::sync::Mutex<SchedulerState>,
    history: Mutex<VecDeque<TaskResult>>,
}

impl std::fmt::Debug for HeartbeatScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatScheduler")
            .field("tasks", &self.task_names())
            .finish_non_exhaustive()
    }
}

impl HeartbeatScheduler {
    /// Scheduler with no tasks registered.
    pub fn new(config: SharedConfig, gate: Arc<SafetyGate>, audit: Arc<AuditLog>) -> Self {
        Self {
            tasks: HashMap::new(),
            config,
            gate,
            audit,
            state: tokio::sync::Mutex::new(SchedulerState::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Register `task`, replacing any task with the same name.
    pub fn register(&mut self, task: Arc<dyn HeartbeatTask>) {
        self.tasks.insert(task.name(), task);
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tasks.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run every enabled, registered task once, ignoring intervals.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unavailable.
    pub async fn run_once(&self) -> anyhow::Result<Vec<TaskResult>> {
        let config = self.config.current()?;
        let now = Utc::now();
        let mut results = Vec::new();
        for task in config.heartbeat.tasks.iter().filter(|t| t.enabled) {
            if self.tasks.contains_key(task.name.as_str()) {
                results.push(self.run_task_at(&task.name, now).await?);
            }
        }
        Ok(results)
    }

    /// Run every task due at `now`. Tasks configured but not registered are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unavailable.
    pub async fn run_due_at(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<TaskResult>> {
        let config = self.config.current()?;
        let due: Vec<String> = {
            let state = self.state.lock().await;
            due_tasks(&config.heartbeat.tasks, &state, now)
                .into_iter()
                .filter(|task| self.tasks.contains_key(task.name.as_str()))
                .map(|task| task.name.clone())
                .collect()
        };

        let mut results = Vec::with_capacity(due.len());
        for name in due {
            results.push(self.run_task_at(&name, now).await?);
        }
        Ok(results)
    }

    /// Run one task immediately, regardless of its schedule.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown task name. Task failures are reported
    /// in the result, not as an error.
    pub async fn run_task(&self, name: &str) -> anyhow::Result<TaskResult> {
        self.run_task_at(name, Utc::now()).await
    }

    /// Run one task with `now` as its logical time.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown task name or when the configuration
    /// is unavailable.
    pub async fn run_task_at(&self, name: &str, now: DateTime<Utc>) -> anyhow::Result<TaskResult> {
        let task = self
            .tasks
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| anyhow::anyhow!("unknown heartbeat task: {name}"))?;
        let config = self.config.current()?;

        // The stricter of the intrinsic and configured tiers applies.
        let configured = config
            .heartbeat
            .tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.tier);
        let tier = if task.tier() == TaskTier::ReadWrite || configured == Some(TaskTier::ReadWrite) {
            TaskTier::ReadWrite
        } else {
            TaskTier::ReadOnly
        };

        let start = Instant::now();
        let (status, message) = match self.admit(name, tier) {
            Some(refusal) => (TaskStatus::Skipped, refusal),
            None => Self::execute(task, now, config.heartbeat.task_timeout()).await,
        };

        self.state.lock().await.record_run(name, now);

        let result = TaskResult {
            name: name.to_owned(),
            status,
            message,
            duration: start.elapsed(),
            finished_at: Utc::now(),
        };
        self.record(&result, tier);
        Ok(result)
    }

    /// Gate read_write tasks; returns why the task may not run.
    fn admit(&self, name: &str, tier: TaskTier) -> Option<String> {
        if tier == TaskTier::ReadOnly {
            return None;
        }
        let request = ActionRequest::new(ActionKind::MemoryWrite, name, "heartbeat");
        match self.gate.evaluate(&request) {
            Decision::Allow => None,
            Decision::RequireConfirmation { .. } => {
                Some("gate requires confirmation; heartbeat cannot confirm".to_owned())
            }
            Decision::Deny(reason) => Some(format!("gate denied: {reason}")),
        }
    }

    async fn execute(
        task: Arc<dyn HeartbeatTask>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> (TaskStatus, String) {
        let ctx = TaskContext { now };
        let mut handle = tokio::spawn(async move { task.run(&ctx).await });
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(message))) => (TaskStatus::Succeeded, message),
            Ok(Ok(Err(e))) => (TaskStatus::Failed, format!("{e:#}")),
            Ok(Err(join_err)) => (TaskStatus::Failed, format!("task panicked: {join_err}")),
            Err(_) => {
                handle.abort();
                (
                    TaskStatus::TimedOut,
                    format!("exceeded {}s timeout", timeout.as_secs()),
                )
            }
        }
    }

    fn record(&self, result: &TaskResult, tier: TaskTier) {
        let level = match result.status {
            TaskStatus::Succeeded => AuditLevel::Info,
            TaskStatus::Skipped => AuditLevel::Warn,
            TaskStatus::Failed | TaskStatus::TimedOut => AuditLevel::Error,
        };
        let duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self.audit.append(
            AuditRecord::new(level, source::HEARTBEAT, result.status.audit_action())
                .detail(format!(
                    "task={} tier={} duration_ms={duration_ms} {}",
                    result.name,
                    tier.as_str(),
                    result.message
                ))
                .outcome(result.status.audit_action().trim_start_matches("task_")),
        ) {
            warn!(task = %result.name, error = %e, "failed to audit log task result");
        }

        match result.status {
            TaskStatus::Succeeded => {
                debug!(task = %result.name, duration_ms, message = %result.message, "heartbeat task completed");
            }
            _ => {
                warn!(task = %result.name, status = ?result.status, message = %result.message, "heartbeat task did not complete");
            }
        }

        if let Ok(mut history) = self.history.lock() {
            if history.len() >= HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
    }

    async fn next_sleep(&self, now: DateTime<Utc>) -> Duration {
        let Ok(config) = self.config.current() else {
            return MIN_SLEEP;
        };
        let state = self.state.lock().await;
        let until_due = next_due(&config.heartbeat.tasks, &state, now)
            .map(|due| due.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO));
        sleep_for(until_due, config.heartbeat.max_sleep())
    }

    /// Run the scheduling loop until `shutdown` flips to `true` or the kill
    /// switch is TRIGGERED.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration becomes unavailable.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let kill_switch = Arc::clone(self.gate.kill_switch());
        let mut state_rx = kill_switch.subscribe();

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Info, source::HEARTBEAT, "heartbeat_started")
                .detail(format!("tasks={}", self.task_names().join(","))),
        ) {
            warn!(error = %e, "failed to audit log heartbeat start");
        }
        info!(tasks = self.tasks.len(), "heartbeat started");

        let reason = loop {
            if *shutdown.borrow() {
                break "shutdown requested";
            }
            if kill_switch.is_triggered() {
                break "kill switch triggered";
            }

            self.run_due_at(Utc::now()).await?;
            if kill_switch.is_triggered() {
                break "kill switch triggered";
            }

            let sleep = self.next_sleep(Utc::now()).await;
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                result = shutdown.changed() => {
                    if result.is_err() {
                        break "shutdown channel closed";
                    }
                }
                result = state_rx.changed() => {
                    if result.is_err() {
                        break "kill switch channel closed";
                    }
                }
            }
        };

        let level = if kill_switch.is_triggered() {
            AuditLevel::Warn
        } else {
            AuditLevel::Info
        };
        if let Err(e) = self.audit.append(
            AuditRecord::new(level, source::HEARTBEAT, "heartbeat_stopped").detail(reason),
        ) {
            warn!(error = %e, "failed to audit log heartbeat stop");
        }
        info!(reason, "heartbeat stopped");
        Ok(())
    }

    /// Last runs and recent results.
    pub async fn status(&self) -> SchedulerStatus {
        let last_runs = self
            .state
            .lock()
            .await
            .last_run
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let recent = self
            .history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        SchedulerStatus { last_runs, recent }
    }
}
