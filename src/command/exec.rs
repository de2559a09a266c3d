//! One-shot command execution
//!
//! Runs a command through `<shell> -c` without a PTY and captures stdout,
//! stderr and the exit code. Uses the same denylist as the interactive bridge.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::env::{command_overrides, workspace_dir};
use super::policy::{CommandPolicy, PolicyViolation};
use super::template;
use crate::config::ServiceConfig;

/// Errors that can occur while executing a one-shot command
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to collect command output: {0}")]
    OutputFailed(String),
}

/// Result type for one-shot execution
pub type ExecResult<T> = Result<T, ExecError>;

/// Outcome of a completed command
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandResult {
    /// The command as submitted, before substitution
    pub command: String,
    /// Exit code, or -1 when the process was terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
    /// Start time in milliseconds since the Unix epoch
    pub executed_at_ms: u64,
}

/// Executes commands synchronously with captured output
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: String,
    working_dir: PathBuf,
    timeout: Duration,
    policy: CommandPolicy,
}

impl CommandRunner {
    /// Create a runner
    pub fn new(
        shell: impl Into<String>,
        working_dir: PathBuf,
        timeout: Duration,
        policy: CommandPolicy,
    ) -> Self {
        Self {
            shell: shell.into(),
            working_dir,
            timeout,
            policy,
        }
    }

    /// Create a runner from the service configuration
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.exec.shell.clone(),
            workspace_dir(config.shell.working_dir.as_deref()),
            Duration::from_secs(config.exec.timeout_secs),
            config.policy.command_policy(),
        )
    }

    /// Substitute `variables` into `command`, check the policy, and run it
    ///
    /// Both the submitted and the substituted text are checked so a variable
    /// cannot introduce a blocked pattern.
    pub async fn run(
        &self,
        command: &str,
        variables: &HashMap<String, String>,
    ) -> ExecResult<CommandResult> {
        let final_command = template::substitute(command, variables);
        self.policy.check(command)?;
        self.policy.check(&final_command)?;

        info!("Executing command: {}", final_command);
        if final_command != command {
            debug!("Original command: {}", command);
        }

        let executed_at_ms = unix_millis();
        let started = Instant::now();

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&final_command)
            .current_dir(&self.working_dir)
            .envs(command_overrides(variables))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout(self.timeout))?
            .map_err(|e| ExecError::OutputFailed(e.to_string()))?;

        let duration = started.elapsed();
        let exit_code = output.status.code().unwrap_or(-1);
        let success = output.status.success();

        info!(
            "Command completed: exit_code={}, duration={:?}, success={}",
            exit_code, duration, success
        );

        Ok(CommandResult {
            command: command.to_string(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            success,
            executed_at_ms,
        })
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
