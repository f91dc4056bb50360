use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::ExecutionError;

/// One command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Deadline after which the process is killed.
    pub timeout: Duration,
    /// Working directory; inherited when unset.
    pub working_directory: Option<PathBuf>,
}

/// Completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// stdout, then stderr after a newline when stderr is non-empty.
    pub output: String,
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Whether the process exited successfully.
    pub success: bool,
}

/// Runs processes for the execution stage.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `invocation` to completion or until its deadline.
    async fn run(&self, invocation: &Invocation) -> Result<RunOutcome, ExecutionError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, invocation: &Invocation) -> Result<RunOutcome, ExecutionError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_directory {
            command.current_dir(dir);
        }
        debug!(program = %invocation.program, args = ?invocation.args, "spawning");

        let output = tokio::time::timeout(invocation.timeout, command.output())
            .await
            .map_err(|_| ExecutionError::Timeout(invocation.timeout))?
            .map_err(|source| ExecutionError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        Ok(RunOutcome {
            output: merge_output(&output.stdout, &output.stderr),
            exit_code: output.status.code(),
            success: output.status.success(),
        })
    }
}

/// Joins captured streams: stdout, then `"\n"` and stderr when stderr is
/// non-empty.
#[must_use]
pub fn merge_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut merged = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        merged.push('\n');
        merged.push_str(&String::from_utf8_lossy(stderr));
    }
    merged
}
