//! External process execution.
//!
//! `ProcessRunner` spawns one command with piped stdout/stderr and consumes both
//! streams in a single select loop alongside the operation's cancellation token
//! and deadline. On Unix the child leads its own process group, so termination
//! (SIGTERM, then SIGKILL after the grace period) reaches every descendant.
//! The child is always reaped before any call here returns.

use crate::error::ProcessError;
use crate::orchestrator::context::{sleep_until_opt, OperationContext};
use crate::orchestrator::broadcaster::ProgressEvent;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;

/// Upper bound on reading leftover output once the child itself has exited.
/// Grandchildren that inherited the pipes can otherwise hold them open forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Program, arguments and environment of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own. `code` is `None` when killed by a signal.
    Exited { code: Option<i32>, success: bool },
    /// Terminated because the operation was cancelled
    Cancelled,
    /// Terminated because the operation deadline passed
    TimedOut,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { success: true, .. })
    }
}

/// Buffered result of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process never started
    pub outcome: Option<ProcessOutcome>,
}

impl CommandOutput {
    fn spawn_failure(message: String) -> Self {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: message,
            outcome: None,
        }
    }

    /// Trimmed stdout, or trimmed stderr when stdout is empty.
    pub fn text(&self) -> String {
        let out = self.stdout.trim();
        if out.is_empty() {
            self.stderr.trim().to_string()
        } else {
            out.to_string()
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.outcome == Some(ProcessOutcome::Cancelled)
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == Some(ProcessOutcome::TimedOut)
    }
}

/// Spawns and supervises external commands.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        ProcessRunner::new(Duration::from_secs(5))
    }
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        ProcessRunner { kill_grace }
    }

    /// Spawn with both pipes captured. The caller owns the returned process.
    pub fn spawn(&self, spec: &CommandSpec) -> Result<RunningProcess, ProcessError> {
        if spec.program.trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::PipeUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::PipeUnavailable("stderr"))?;

        log::debug!("[Runner] Spawned pid {:?}: {}", child.id(), spec.display());

        Ok(RunningProcess {
            pid: child.id(),
            child,
            stdout: BufReader::new(stdout).lines(),
            stderr: BufReader::new(stderr).lines(),
            kill_grace: self.kill_grace,
            command: spec.display(),
        })
    }

    /// Run to completion and buffer the output.
    ///
    /// With a context, every line is published as an `output`/`error` event for the
    /// operation and the wait honors its cancellation and deadline. Spawn failures
    /// come back as `success = false` with the OS error text, never as an `Err`.
    pub async fn run(&self, spec: &CommandSpec, ctx: Option<&OperationContext>) -> CommandOutput {
        let process = match self.spawn(spec) {
            Ok(process) => process,
            Err(e) => {
                log::warn!("[Runner] {}", e);
                let message = e.to_string();
                if let Some(ctx) = ctx {
                    ctx.error(message.clone());
                }
                return CommandOutput::spawn_failure(message);
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let result = process
            .wait_streaming(ctx, |kind, line| {
                let buffer = match kind {
                    StreamKind::Stdout => &mut stdout,
                    StreamKind::Stderr => &mut stderr,
                };
                buffer.push_str(&line);
                buffer.push('\n');

                if let Some(ctx) = ctx {
                    ctx.log_output(&line);
                    let event = match kind {
                        StreamKind::Stdout => ProgressEvent::output(ctx.id(), line),
                        StreamKind::Stderr => ProgressEvent::error(ctx.id(), line),
                    };
                    ctx.publish(event);
                }
            })
            .await;

        match result {
            Ok(outcome) => CommandOutput {
                success: outcome.is_success(),
                stdout,
                stderr,
                outcome: Some(outcome),
            },
            Err(e) => {
                log::error!("[Runner] {}", e);
                stderr.push_str(&e.to_string());
                CommandOutput {
                    success: false,
                    stdout,
                    stderr,
                    outcome: None,
                }
            }
        }
    }
}

/// A spawned child with its output streams.
pub struct RunningProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
    kill_grace: Duration,
    command: String,
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Stream lines to `on_line` until the process exits, the operation is
    /// cancelled, or its deadline passes. Terminates and reaps the child on the
    /// latter two.
    pub async fn wait_streaming<F>(
        mut self,
        ctx: Option<&OperationContext>,
        mut on_line: F,
    ) -> Result<ProcessOutcome, ProcessError>
    where
        F: FnMut(StreamKind, String),
    {
        let mut cancel_rx = ctx.map(|c| c.cancel_receiver());
        let deadline = ctx.and_then(|c| c.deadline());

        if ctx.map_or(false, |c| c.is_cancelled()) {
            self.terminate().await;
            return Ok(ProcessOutcome::Cancelled);
        }

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut cancel_open = cancel_rx.is_some();

        let status = loop {
            tokio::select! {
                line = self.stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => on_line(StreamKind::Stdout, line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        log::warn!("[Runner] stdout read error: {}", e);
                        stdout_open = false;
                    }
                },
                line = self.stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => on_line(StreamKind::Stderr, line),
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        log::warn!("[Runner] stderr read error: {}", e);
                        stderr_open = false;
                    }
                },
                status = self.child.wait() => {
                    break status.map_err(ProcessError::WaitFailed)?;
                }
                changed = wait_cancel(cancel_rx.as_mut()), if cancel_open => match changed {
                    Some(true) => {
                        log::info!("[Runner] Cancellation requested, terminating: {}", self.command);
                        self.terminate().await;
                        return Ok(ProcessOutcome::Cancelled);
                    }
                    Some(false) => {}
                    // Sender gone: nobody can cancel any more
                    None => cancel_open = false,
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    log::warn!("[Runner] Deadline passed, terminating: {}", self.command);
                    self.terminate().await;
                    return Ok(ProcessOutcome::TimedOut);
                }
            }
        };

        self.drain(&mut on_line, stdout_open, stderr_open).await;

        log::debug!("[Runner] '{}' exited with {}", self.command, status);
        Ok(ProcessOutcome::Exited {
            code: status.code(),
            success: status.success(),
        })
    }

    /// Read what the exited child left in its pipes.
    async fn drain<F>(&mut self, on_line: &mut F, mut stdout_open: bool, mut stderr_open: bool)
    where
        F: FnMut(StreamKind, String),
    {
        let until = Instant::now() + DRAIN_TIMEOUT;
        while stdout_open || stderr_open {
            tokio::select! {
                line = self.stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => on_line(StreamKind::Stdout, line),
                    _ => stdout_open = false,
                },
                line = self.stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => on_line(StreamKind::Stderr, line),
                    _ => stderr_open = false,
                },
                _ = tokio::time::sleep_until(until) => {
                    log::warn!("[Runner] Output of '{}' still open after exit, detaching", self.command);
                    break;
                }
            }
        }
    }

    /// SIGTERM the process group, escalate to SIGKILL after the grace period, reap.
    async fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    log::debug!("[Runner] pid {} exited after SIGTERM: {}", pid, status);
                    // Descendants may have ignored SIGTERM
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                    return;
                }
                Ok(Err(e)) => log::warn!("[Runner] wait after SIGTERM failed: {}", e),
                Err(_) => log::warn!(
                    "[Runner] pid {} ignored SIGTERM for {:?}, sending SIGKILL",
                    pid,
                    self.kill_grace
                ),
            }
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }

        if let Err(e) = self.child.kill().await {
            log::debug!("[Runner] kill: {}", e);
        }
        if let Err(e) = self.child.wait().await {
            log::warn!("[Runner] Failed to reap '{}': {}", self.command, e);
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(raw), signal) {
        // ESRCH once the whole group is gone
        log::trace!("[Runner] killpg({}, {:?}): {}", raw, signal, e);
    }
}

/// Resolve on the next cancellation change: `Some(flag)`, or `None` if the sender dropped.
async fn wait_cancel(rx: Option<&mut tokio::sync::watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
