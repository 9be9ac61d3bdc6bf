//! Command execution abstraction for testability.
//!
//! [`CommandExecutor`] is the raw process seam (mocked in tests).
//! [`CommandRunner`] sits on top of it and encodes the logging policy:
//! mutating calls go through [`CommandRunner::run`] and log failures,
//! existence probes go through [`CommandRunner::run_quiet`] where a failure
//! is only a negative answer.

use anyhow::Result;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, error};

use crate::error::CommandError;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Stdout followed by stderr, as a terminal would show them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }

    fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Trait for command execution, allowing dependency injection for testing.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with the given arguments.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Execute a command with stdin input.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;

    /// Whether `cmd` resolves to an executable on PATH.
    fn command_exists(&self, cmd: &str) -> bool;
}

/// Real implementation of CommandExecutor that runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_data.as_bytes())?;
        }

        let output = child.wait_with_output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn command_exists(&self, cmd: &str) -> bool {
        which::which(cmd).is_ok()
    }
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has trouble with lifetimes in `&[&str]`, so the trait takes
/// `&[String]`.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn render_command(cmd: &str, args: &[&str]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    }
}

/// Logging-aware front end over a [`CommandExecutor`].
pub struct CommandRunner {
    executor: Box<dyn CommandExecutor>,
}

impl CommandRunner {
    pub fn new(executor: Box<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Runner backed by real processes.
    pub fn real() -> Self {
        Self::new(Box::new(RealCommandExecutor::new()))
    }

    /// Spawn the command and return its raw output without judging the exit status.
    pub fn output(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        self.executor
            .execute(cmd, &args_to_strings(args))
            .map_err(|e| CommandError::Spawn {
                command: render_command(cmd, args),
                reason: e.to_string(),
            })
    }

    /// Run a mutating command. Failures are logged and returned.
    pub fn run(&self, cmd: &str, args: &[&str]) -> Result<(), CommandError> {
        debug!(command = cmd, args = ?args, "Executing command");
        let output = self.output(cmd, args).map_err(|e| {
            error!(command = cmd, args = ?args, error = %e, "Command failed");
            e
        })?;
        self.check(cmd, args, &output, &output.stderr)
    }

    /// Run a command feeding `stdin` to it. Failures are logged and returned.
    pub fn run_with_stdin(&self, cmd: &str, args: &[&str], stdin: &str) -> Result<(), CommandError> {
        debug!(command = cmd, args = ?args, bytes = stdin.len(), "Executing command with stdin");
        let output = self
            .executor
            .execute_with_stdin(cmd, &args_to_strings(args), stdin)
            .map_err(|e| CommandError::Spawn {
                command: render_command(cmd, args),
                reason: e.to_string(),
            })?;
        self.check(cmd, args, &output, &output.stderr)
    }

    /// Existence probe: `true` on exit code 0. Never logs a failure.
    pub fn run_quiet(&self, cmd: &str, args: &[&str]) -> bool {
        self.executor
            .execute(cmd, &args_to_strings(args))
            .map(|o| o.success)
            .unwrap_or(false)
    }

    /// Run a command and return stdout+stderr for parsing. Failures are logged.
    pub fn run_captured(&self, cmd: &str, args: &[&str]) -> Result<String, CommandError> {
        debug!(command = cmd, args = ?args, "Executing command with output");
        let output = self.output(cmd, args)?;
        let combined = output.combined();
        self.check(cmd, args, &output, &combined)?;
        Ok(combined)
    }

    /// Probe variant of [`run_captured`](Self::run_captured): `None` on any failure.
    pub fn run_captured_quiet(&self, cmd: &str, args: &[&str]) -> Option<String> {
        self.executor
            .execute(cmd, &args_to_strings(args))
            .ok()
            .filter(|o| o.success)
            .map(|o| o.combined())
    }

    /// Run a command and return only its stdout (for dumps that are written to files).
    pub fn run_stdout(&self, cmd: &str, args: &[&str]) -> Result<String, CommandError> {
        debug!(command = cmd, args = ?args, "Executing command for stdout");
        let output = self.output(cmd, args)?;
        self.check(cmd, args, &output, &output.stderr)?;
        Ok(output.stdout)
    }

    pub fn command_exists(&self, cmd: &str) -> bool {
        let exists = self.executor.command_exists(cmd);
        debug!(command = cmd, exists, "Checking command existence");
        exists
    }

    pub fn daemon_reload(&self) -> Result<(), CommandError> {
        debug!("Reloading systemd daemon");
        self.run("systemctl", &["daemon-reload"])
    }

    pub fn enable_service(&self, unit: &str) -> Result<(), CommandError> {
        debug!(unit, "Enabling unit");
        self.run("systemctl", &["enable", unit])
    }

    pub fn start_service(&self, unit: &str) -> Result<(), CommandError> {
        debug!(unit, "Starting unit");
        self.run("systemctl", &["start", unit])
    }

    pub fn restart_service(&self, unit: &str) -> Result<(), CommandError> {
        debug!(unit, "Restarting unit");
        self.run("systemctl", &["restart", unit])
    }

    fn check(
        &self,
        cmd: &str,
        args: &[&str],
        output: &CommandOutput,
        diagnostics: &str,
    ) -> Result<(), CommandError> {
        if output.success {
            return Ok(());
        }
        let status = output.status_text();
        error!(
            command = cmd,
            args = ?args,
            status = %status,
            output = %diagnostics.trim(),
            "Command failed"
        );
        Err(CommandError::Failed {
            command: render_command(cmd, args),
            status,
            stderr: diagnostics.trim().to_string(),
        })
    }
}
