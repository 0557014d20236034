//! Lifecycle of a single external process.
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::Child;

use crate::common::error::ExecError;
use crate::program::{ProgramDefinition, command_from_definition, map_spawn_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    NotStarted,
    Running,
    Exited,
    /// Reported by [`ProcessRun::wait`] when the timeout elapses. The process may still be
    /// alive; it is up to the caller to terminate it.
    TimedOut,
    Terminated,
    Error,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::NotStarted | RunState::Running)
    }
}

/// Supervises one external command.
///
/// Instances share no mutable state, so many runs can be polled from a single loop.
pub struct ProcessRun {
    program: ProgramDefinition,
    state: RunState,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    exit_status: Option<ExitStatus>,
    error: Option<String>,
}

impl ProcessRun {
    pub fn new(program: ProgramDefinition) -> Self {
        Self {
            program,
            state: RunState::NotStarted,
            child: None,
            pid: None,
            started_at: None,
            exit_status: None,
            error: None,
        }
    }

    /// Creates the run and immediately starts it.
    pub fn spawn(program: ProgramDefinition) -> crate::Result<Self> {
        let mut run = Self::new(program);
        run.start()?;
        Ok(run)
    }

    pub fn start(&mut self) -> crate::Result<()> {
        if self.state != RunState::NotStarted {
            return Err(ExecError::GenericError(format!(
                "Process {:?} was already started",
                self.program.display_args()
            )));
        }
        let result = command_from_definition(&self.program).and_then(|mut command| {
            command
                .spawn()
                .map_err(|error| map_spawn_error(error, &self.program))
        });
        match result {
            Ok(child) => {
                self.pid = child.id();
                self.child = Some(child);
                self.started_at = Some(Instant::now());
                self.state = RunState::Running;
                log::debug!(
                    "Started process {:?} with pid {:?}",
                    self.program.display_args(),
                    self.pid
                );
                Ok(())
            }
            Err(error) => {
                let error = match error {
                    ExecError::IoError(e) => ExecError::LaunchFailure(e.to_string()),
                    error => error,
                };
                self.state = RunState::Error;
                self.error = Some(error.to_string());
                Err(error)
            }
        }
    }

    /// Checks whether the process has finished without blocking.
    pub fn poll(&mut self) -> RunState {
        if self.exit_status.is_some() {
            return self.state;
        }
        let Some(child) = self.child.as_mut() else {
            return self.state;
        };
        match child.try_wait() {
            Ok(Some(status)) => self.record_exit(status, RunState::Exited),
            Ok(None) => {}
            Err(error) => self.record_error(format!("Cannot check process status: {error}")),
        }
        self.state
    }

    /// Waits for the process to finish for at most `timeout`.
    ///
    /// When the timeout elapses, the run switches to [`RunState::TimedOut`] and the process
    /// is left running. The state stays `TimedOut` even when the process exits later.
    pub async fn wait(&mut self, timeout: Duration) -> RunState {
        if self.exit_status.is_some() {
            return self.state;
        }
        let Some(child) = self.child.as_mut() else {
            return self.state;
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => self.record_exit(status, RunState::Exited),
            Ok(Err(error)) => self.record_error(format!("Cannot wait for process: {error}")),
            Err(_) => {
                log::debug!("Process {:?} timed out after {timeout:?}", self.pid);
                self.state = RunState::TimedOut;
            }
        }
        self.state
    }

    /// Sends SIGTERM to the process group, waits `grace_period` and then sends SIGKILL.
    pub async fn terminate(&mut self, grace_period: Duration) -> RunState {
        if self.exit_status.is_some() {
            return self.state;
        }
        let (Some(child), Some(pid)) = (self.child.as_mut(), self.pid) else {
            return self.state;
        };

        if let Err(error) = send_signal(pid, Signal::SIGTERM) {
            log::debug!("{error}");
        }
        let status = match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                log::debug!("Process {pid} did not end after SIGTERM, sending SIGKILL");
                if let Err(error) = send_signal(pid, Signal::SIGKILL) {
                    log::debug!("{error}");
                    // The group is gone or unreachable, kill at least the direct child.
                    let _ = child.start_kill();
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => self.record_exit(status, RunState::Terminated),
            Err(error) => self.record_error(format!("Cannot wait for terminated process: {error}")),
        }
        self.state
    }

    fn record_exit(&mut self, status: ExitStatus, state: RunState) {
        self.exit_status = Some(status);
        self.child = None;
        if self.state != RunState::TimedOut {
            self.state = state;
        }
        log::debug!(
            "Process {:?} finished with {status}, state {:?}",
            self.pid,
            self.state
        );
    }

    fn record_error(&mut self, message: String) {
        log::warn!("Process {:?}: {message}", self.pid);
        self.error = Some(message);
        self.child = None;
        self.state = RunState::Error;
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &ProgramDefinition {
        &self.program
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| start.elapsed())
    }

    /// Returns true once the process is gone (or could not be supervised anymore).
    pub fn has_finished(&self) -> bool {
        self.exit_status.is_some() || self.state == RunState::Error
    }

    /// Exit code of the process. Missing until the process has finished, and also when it
    /// was ended by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|status| status.code())
    }

    pub fn exit_signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.exit_status.and_then(|status| status.signal())
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn stdout_path(&self) -> Option<PathBuf> {
        if self.has_finished() {
            self.program.stdout_path()
        } else {
            None
        }
    }

    pub fn stderr_path(&self) -> Option<PathBuf> {
        if self.has_finished() {
            self.program.stderr_path()
        } else {
            None
        }
    }

    /// Human readable description of how the process ended.
    pub fn describe_exit(&self) -> String {
        match (self.exit_code(), self.exit_signal(), &self.error) {
            (_, _, Some(error)) => error.clone(),
            (Some(code), _, _) => format!("Process exited with code {code}"),
            (None, Some(signal), _) => format!(
                "Process was terminated by signal {signal} ({})",
                signal_name(signal)
            ),
            (None, None, None) => "Process has not finished".to_string(),
        }
    }
}

fn send_signal(pid: u32, signal: Signal) -> crate::Result<()> {
    let pgid = nix::unistd::getpgid(Some(Pid::from_raw(pid as i32)))
        .map_err(|error| format!("Cannot get PGID for PID {pid}: {error:?}"))?;
    signal::killpg(pgid, Some(signal))
        .map_err(|error| format!("Cannot send signal {signal} to PGID {pgid}: {error:?}"))?;
    Ok(())
}

/// Provide a user-friendly name of a signal, for a subset of common signals.
fn signal_name(signal: i32) -> &'static str {
    match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        _ => "unknown",
    }
}
