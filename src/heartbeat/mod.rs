//! Heartbeat: periodic integrity, health, and maintenance tasks.
//!
//! A single cooperative loop runs due tasks one after another under a
//! per-task timeout. Task faults are isolated into a [`TaskResult`] and
//! audited; they never stop the loop. read_write tasks must pass the
//! [`SafetyGate`](crate::gate::SafetyGate) before they run.

pub mod health;
pub mod scheduler;
pub mod tasks;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use health::{HealthReport, ProcSampler, ResourceSample, ResourceSampler};
pub use scheduler::{HeartbeatScheduler, SchedulerState, SchedulerStatus};

/// Whether a task mutates shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTier {
    /// Observes only; runs without the gate.
    ReadOnly,
    /// Mutates shared state; gated as `memory_write`.
    ReadWrite,
}

impl TaskTier {
    /// snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::ReadWrite => "read_write",
        }
    }
}

/// Built-in task names with their intrinsic tier.
pub const BUILTIN_TASKS: [(&str, TaskTier); 5] = [
    (tasks::SKILL_INTEGRITY_CHECK, TaskTier::ReadOnly),
    (tasks::SYSTEM_HEALTH_CHECK, TaskTier::ReadOnly),
    (tasks::AUDIT_CHAIN_CHECK, TaskTier::ReadOnly),
    (tasks::AUDIT_INDEX_UPDATE, TaskTier::ReadWrite),
    (tasks::STALE_STATE_CHECK, TaskTier::ReadWrite),
];

/// Intrinsic tier of a built-in task, `None` for unknown names.
pub fn builtin_task_tier(name: &str) -> Option<TaskTier> {
    BUILTIN_TASKS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, tier)| *tier)
}

/// Inputs handed to a task run.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// Logical time of this run.
    pub now: DateTime<Utc>,
}

/// A periodic check or maintenance job.
#[async_trait]
pub trait HeartbeatTask: Send + Sync {
    /// Unique task name.
    fn name(&self) -> &'static str;

    /// Intrinsic tier.
    fn tier(&self) -> TaskTier;

    /// Run once; the message summarises what happened.
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<String>;
}

/// Outcome class of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Finished without error.
    Succeeded,
    /// Returned an error or panicked.
    Failed,
    /// Exceeded the task timeout and was cancelled.
    TimedOut,
    /// Not run because the gate did not allow it.
    Skipped,
}

impl TaskStatus {
    /// Audit action recorded for this status.
    pub fn audit_action(&self) -> &'static str {
        match self {
            Self::Succeeded => "task_completed",
            Self::Failed => "task_failed",
            Self::TimedOut => "task_timeout",
            Self::Skipped => "task_skipped",
        }
    }
}

/// Result of one task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    /// Task name.
    pub name: String,
    /// Outcome class.
    pub status: TaskStatus,
    /// Summary or error text.
    pub message: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// When it finished.
    pub finished_at: DateTime<Utc>,
}
