//! Shell commands run as a unit of work.
use std::{
    process::{Child, Command, Stdio},
    thread,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG, SLEEP_SLICE, WORKER_INDEX_ENV},
    error::JobError,
    signals::ShutdownFlag,
};

/// Runs one command line through `sh -c`.
///
/// The command inherits stdout/stderr, so inside a daemon its output lands in
/// the log file. When the shutdown flag is raised while the command is running,
/// the command receives SIGTERM and the run counts as finished.
#[derive(Debug, Clone)]
pub struct ShellJob {
    command: String,
    slot: Option<usize>,
    shutdown: ShutdownFlag,
}

impl ShellJob {
    /// Creates a job for `command` that stops early once `shutdown` is raised.
    pub fn new(command: impl Into<String>, shutdown: ShutdownFlag) -> Self {
        Self {
            command: command.into(),
            slot: None,
            shutdown,
        }
    }

    /// Exports `slot` to the command as `BACKJOB_WORKER_INDEX`.
    pub fn slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }

    /// The command line handed to the shell.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Runs the command to completion.
    pub fn run(&self) -> Result<(), JobError> {
        let mut command = Command::new(DEFAULT_SHELL);
        command
            .arg(SHELL_COMMAND_FLAG)
            .arg(&self.command)
            .stdin(Stdio::null());
        if let Some(slot) = self.slot {
            command.env(WORKER_INDEX_ENV, slot.to_string());
        }

        let mut child = command.spawn().map_err(|source| JobError::Spawn {
            command: self.command.clone(),
            source,
        })?;
        debug!("Running `{}` as pid {}", self.command, child.id());

        loop {
            let polled = child.try_wait().map_err(|source| JobError::Wait {
                command: self.command.clone(),
                source,
            })?;
            if let Some(status) = polled {
                return if status.success() {
                    Ok(())
                } else {
                    Err(JobError::Failed {
                        command: self.command.clone(),
                        status,
                    })
                };
            }

            if self.shutdown.is_raised() {
                self.interrupt(&mut child)?;
                return Ok(());
            }

            thread::sleep(SLEEP_SLICE);
        }
    }

    fn interrupt(&self, child: &mut Child) -> Result<(), JobError> {
        let pid = Pid::from_raw(child.id() as i32);
        info!("Stopping `{}` (pid {pid}) on shutdown", self.command);
        if let Err(err) = signal::kill(pid, Signal::SIGTERM)
            && err != Errno::ESRCH
        {
            warn!("Failed to send SIGTERM to pid {pid}: {err}");
        }

        child.wait().map_err(|source| JobError::Wait {
            command: self.command.clone(),
            source,
        })?;
        Ok(())
    }
}
