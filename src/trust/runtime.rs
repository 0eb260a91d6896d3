//! Invocation of verified skills through a narrow entry-point interface.
//!
//! A runtime only ever sees an [`ExecutableHandle`], so code reaches the
//! interpreter exclusively through [`SkillRegistry::load_for_execution`].
//!
//! [`SkillRegistry::load_for_execution`]: super::registry::SkillRegistry::load_for_execution

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::registry::ExecutableHandle;
use crate::error::{Classified, ErrorClass};

/// Environment variable naming the entry point to call.
pub const ENTRY_ENV: &str = "AETHER_SKILL_ENTRY";
/// Environment variable carrying the JSON-encoded input.
pub const INPUT_ENV: &str = "AETHER_SKILL_INPUT";

/// Bootstrap passed to a Python interpreter: reads the verified source from
/// stdin, calls the requested entry point, prints its JSON result.
pub const PYTHON_BOOTSTRAP: &str = r#"import json, os, sys
namespace = {"__name__": "aether_skill"}
exec(compile(sys.stdin.read(), "<skill>", "exec"), namespace)
entry = os.environ.get("AETHER_SKILL_ENTRY", "run")
handler = namespace.get(entry)
if not callable(handler):
    sys.exit("skill has no callable entry point " + entry)
payload = json.loads(os.environ.get("AETHER_SKILL_INPUT", "null"))
result = handler(payload) if entry == "run" else handler()
print(json.dumps(result))
"#;

/// Entry points a skill may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillEntry {
    /// `run(input) -> output`.
    Run,
    /// `describe() -> metadata`.
    Describe,
}

impl SkillEntry {
    /// Name of the function in skill source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Describe => "describe",
        }
    }

    /// Parse an entry-point name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(Self::Run),
            "describe" => Some(Self::Describe),
            _ => None,
        }
    }
}

/// Skill invocation failures.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The interpreter could not be started.
    #[error("failed to start interpreter {interpreter}: {source}")]
    Spawn {
        /// Interpreter command.
        interpreter: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Piping source or collecting output failed.
    #[error("skill {name} I/O error: {source}")]
    Io {
        /// Skill name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The skill ran past its time limit and was killed.
    #[error("skill {name} timed out after {secs}s")]
    TimedOut {
        /// Skill name.
        name: String,
        /// Limit in seconds.
        secs: u64,
    },

    /// The skill exited unsuccessfully.
    #[error("skill {name} failed (exit {code:?}): {stderr}")]
    Failed {
        /// Skill name.
        name: String,
        /// Exit code, if any.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

impl Classified for RuntimeError {
    fn class(&self) -> ErrorClass {
        ErrorClass::ResourceFault
    }

    fn reason_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "runtime_spawn",
            Self::Io { .. } => "runtime_io",
            Self::TimedOut { .. } => "runtime_timeout",
            Self::Failed { .. } => "runtime_failed",
        }
    }
}

/// Executes verified skill code.
#[async_trait]
pub trait SkillRuntime: Send + Sync {
    /// Call `entry` of the skill behind `handle` with `input`.
    async fn invoke(
        &self,
        handle: &ExecutableHandle,
        entry: SkillEntry,
        input: Value,
    ) -> Result<Value, RuntimeError>;
}

/// Runs skills in a child interpreter process.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    interpreter: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessRuntime {
    /// Runtime invoking `interpreter args...` with the source on stdin.
    pub fn new(interpreter: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            args,
            timeout,
        }
    }

    /// Python runtime using [`PYTHON_BOOTSTRAP`].
    pub fn python(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self::new(
            interpreter,
            vec!["-c".to_owned(), PYTHON_BOOTSTRAP.to_owned()],
            timeout,
        )
    }
}

#[async_trait]
impl SkillRuntime for ProcessRuntime {
    async fn invoke(
        &self,
        handle: &ExecutableHandle,
        entry: SkillEntry,
        input: Value,
    ) -> Result<Value, RuntimeError> {
        let name = handle.name().to_owned();
        let io_err = |source| RuntimeError::Io {
            name: name.clone(),
            source,
        };

        let mut child = Command::new(&self.interpreter)
            .args(&self.args)
            .env(ENTRY_ENV, entry.as_str())
            .env(INPUT_ENV, input.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                interpreter: self.interpreter.clone(),
                source,
            })?;

        debug!(skill = %name, entry = entry.as_str(), "skill process started");

        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(handle.source()).await {
                // The interpreter exited without reading its whole input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(e),
                Ok(()) => stdin.shutdown().await,
            }
        };
        let run = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.and(output)
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result.map_err(io_err)?,
            Err(_) => {
                warn!(skill = %name, secs = self.timeout.as_secs(), "skill timed out");
                return Err(RuntimeError::TimedOut {
                    name,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(RuntimeError::Failed {
                name,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_owned())))
    }
}
