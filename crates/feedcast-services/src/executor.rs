//! Task executor — the pluggable renderer the worker calls.
//!
//! The browser renderer lives outside this workspace. [`CommandExecutor`]
//! bridges to it as a subprocess: the task envelope goes in on stdin, the
//! result payload comes back on stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use feedcast_core::config::WorkerConfig;
use feedcast_core::{Fingerprint, Task, TaskEnvelope};

/// What the worker hands the executor.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub fingerprint: Fingerprint,
    pub task: Task,
    /// 1 on first delivery.
    pub attempt: u32,
    /// Stored cookies for the task's origin, when the task brings none.
    pub cookies: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub reason: String,
    /// `Some` asks for redelivery after the delay; `None` drops the item.
    pub retry_after: Option<Duration>,
}

impl TaskFailure {
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn retry(reason: impl Into<String>, after: Duration) -> Self {
        Self {
            reason: reason.into(),
            retry_after: Some(after),
        }
    }
}

/// What the executor hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Result payload to cache under the request's fingerprint.
    Completed(Bytes),
    Failed(TaskFailure),
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: TaskRequest) -> TaskOutcome;
}

// ── Subprocess executor ───────────────────────────────────────────────────────

/// Stored cookies reach the extractor through this variable.
pub const COOKIE_ENV: &str = "FEEDCAST_COOKIE";

/// Runs an external extractor once per task.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    retry_delay: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            retry_delay: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            timeout: config.exec_timeout(),
            retry_delay: config.retry_delay(),
        }
    }

    async fn run(&self, input: Vec<u8>, cookies: Option<&str>) -> Result<Vec<u8>, TaskFailure> {
        let mut command = tokio::process::Command::new(&self.program);
        if let Some(cookies) = cookies {
            command.env(COOKIE_ENV, cookies);
        }
        let mut child = command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            // Missing binary or fd exhaustion: another worker may do better.
            .map_err(|e| {
                TaskFailure::retry(
                    format!("failed to spawn '{}': {}", self.program, e),
                    self.retry_delay,
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| TaskFailure::permanent(format!("failed to write task: {e}")))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TaskFailure::permanent(format!("extractor timed out after {:?}", self.timeout))
            })?
            .map_err(|e| TaskFailure::permanent(format!("extractor wait failed: {e}")))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskFailure::permanent(format!(
                "exit code {}: {}",
                code,
                truncate(stderr.trim(), 200)
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, request: TaskRequest) -> TaskOutcome {
        let cookies = request.cookies;
        let input = match TaskEnvelope::new(request.task).encode() {
            Ok(v) => v,
            Err(e) => return TaskOutcome::Failed(TaskFailure::permanent(e.to_string())),
        };

        let stdout = match self.run(input, cookies.as_deref()).await {
            Ok(v) => v,
            Err(failure) => return TaskOutcome::Failed(failure),
        };

        // Never cache something a reader can't parse.
        if let Err(e) = serde_json::from_slice::<serde::de::IgnoredAny>(&stdout) {
            return TaskOutcome::Failed(TaskFailure::permanent(format!(
                "extractor returned invalid JSON: {e}"
            )));
        }
        TaskOutcome::Completed(Bytes::from(stdout))
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
