//! Host command execution
//!
//! Every privileged host mutation goes through a [`CommandRunner`]. The runner
//! logs each invocation before it starts and keeps error text bounded, so a
//! noisy tool cannot flood the status records an error ends up in. It never
//! retries; callers wrap network-sensitive commands in
//! [`machina_common::retry::retry_with_backoff`].

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use machina_common::{Error, Result};

/// Maximum number of characters of stderr carried in a command error
pub const STDERR_EXCERPT_CHARS: usize = 256;

/// Truncate a string to `limit` characters, never splitting a code point.
///
/// Truncated strings get a `[N more chars]` suffix.
pub fn truncate(input: &str, limit: usize) -> String {
    let total = input.chars().count();
    if limit >= total {
        return input.to_string();
    }
    let head: String = input.chars().take(limit).collect();
    format!("{} [{} more chars]", head, total - limit)
}

/// A program plus arguments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCommand {
    /// Program to run (resolved via PATH)
    pub program: String,
    /// Arguments, passed verbatim
    pub args: Vec<String>,
}

impl HostCommand {
    /// Command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs host commands (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and return its stdout.
    ///
    /// Fails on non-zero exit with a bounded stderr excerpt.
    async fn run_captured(&self, cmd: &HostCommand) -> Result<String>;

    /// Run a command, mirroring its stdout as it is produced.
    ///
    /// Fails on non-zero exit with a bounded stderr excerpt.
    async fn run_streaming(&self, cmd: &HostCommand) -> Result<()>;

    /// Run a command with `input` written to its stdin
    async fn run_with_stdin(&self, cmd: &HostCommand, input: &str) -> Result<()>;
}

/// Runner that spawns real processes
#[derive(Clone, Debug, Default)]
pub struct RealCommandRunner;

fn failure(cmd: &HostCommand, status: impl fmt::Display, stderr: &str) -> Error {
    Error::command(
        cmd.to_string(),
        format!("{}\n{}", status, truncate(stderr, STDERR_EXCERPT_CHARS)),
    )
}

fn spawn_failure(cmd: &HostCommand, e: std::io::Error) -> Error {
    Error::command(cmd.to_string(), format!("failed to execute: {}", e))
}

#[async_trait]
impl CommandRunner for RealCommandRunner {
    async fn run_captured(&self, cmd: &HostCommand) -> Result<String> {
        info!(command = %cmd, "Running captured");

        let output = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_failure(cmd, e))?;

        if !output.status.success() {
            return Err(failure(
                cmd,
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_streaming(&self, cmd: &HostCommand) -> Result<()> {
        info!(command = %cmd, "Running");

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_failure(cmd, e))?;

        // stderr is drained concurrently so a chatty child cannot block on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| Error::io(format!("reading stdout of {}", cmd.program), e))?
            {
                println!("{}", line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::io(format!("waiting for {}", cmd.program), e))?;

        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            return Err(failure(cmd, status, &stderr));
        }

        Ok(())
    }

    async fn run_with_stdin(&self, cmd: &HostCommand, input: &str) -> Result<()> {
        info!(command = %cmd, "Running with stdin");
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_failure(cmd, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::io(format!("writing stdin of {}", cmd.program), e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::io(format!("waiting for {}", cmd.program), e))?;

        if !output.status.success() {
            return Err(failure(
                cmd,
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }
}

/// Log a message locally and to the host journal.
///
/// The journal line is tagged like the daemon's own output. Failure to reach
/// `logger` is logged and otherwise ignored.
pub async fn log_system(runner: &dyn CommandRunner, message: &str) {
    info!("{}", message);
    let line = format!("machine-config-daemon[{}]: {}", std::process::id(), message);
    if let Err(e) = runner
        .run_with_stdin(&HostCommand::new("logger"), &line)
        .await
    {
        error!(error = %e, "failed to invoke logger");
    }
}
