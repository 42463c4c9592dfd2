//! Exclusive PID files tied to the lifetime of the process that created them.
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DaemonError, PidFileError};

/// Creates PID files, refusing to touch one that already exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidFileGuard;

impl PidFileGuard {
    /// Creates `path` containing the calling process's PID.
    ///
    /// Fails with [`DaemonError::AlreadyRunning`] when anything already exists at
    /// `path`; the existing file is left untouched.
    pub fn acquire(path: impl AsRef<Path>) -> Result<OwnedPidFile, DaemonError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DaemonError::AlreadyRunning {
                path: path.to_path_buf(),
            });
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(DaemonError::AlreadyRunning {
                    path: path.to_path_buf(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let creator = Pid::this();
        writeln!(file, "{creator}")?;
        file.sync_all()?;
        debug!("Wrote PID file {:?} for pid {creator}", path);

        Ok(OwnedPidFile {
            path: path.to_path_buf(),
            creator,
            released: false,
        })
    }
}

/// Handle to a PID file created by [`PidFileGuard::acquire`].
///
/// The file is removed on [`release`](Self::release) or drop, but only by the
/// process that created it. A forked child inheriting the handle never deletes it.
#[derive(Debug)]
pub struct OwnedPidFile {
    path: PathBuf,
    creator: Pid,
    released: bool,
}

impl OwnedPidFile {
    /// Path of the PID file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID of the process that created the file.
    pub fn creator_pid(&self) -> Pid {
        self.creator
    }

    /// Removes the PID file if the caller is its creator. Returns whether a file
    /// was removed.
    pub fn release(&mut self) -> bool {
        if self.released || Pid::this() != self.creator {
            return false;
        }
        self.released = true;

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed PID file {:?}", self.path);
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                warn!("Failed to remove PID file {:?}: {err}", self.path);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_creator(path: PathBuf, creator: Pid) -> Self {
        Self {
            path,
            creator,
            released: false,
        }
    }
}

impl Drop for OwnedPidFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Liveness of the process recorded in a PID file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "pid", rename_all = "snake_case")]
pub enum PidStatus {
    /// The recorded process answers a null signal.
    Running(i32),
    /// The file exists but its process is gone.
    Stale(i32),
    /// No PID file.
    Absent,
}

/// Reads the PID recorded at `path`, if the file exists.
pub fn read_pid(path: impl AsRef<Path>) -> Result<Option<Pid>, PidFileError> {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(|pid| Some(Pid::from_raw(pid)))
        .ok_or_else(|| PidFileError::Malformed {
            path: path.to_path_buf(),
        })
}

/// Reports whether the process recorded at `path` is alive.
pub fn probe(path: impl AsRef<Path>) -> Result<PidStatus, PidFileError> {
    let Some(pid) = read_pid(path)? else {
        return Ok(PidStatus::Absent);
    };

    match signal::kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => Ok(PidStatus::Running(pid.as_raw())),
        Err(_) => Ok(PidStatus::Stale(pid.as_raw())),
    }
}
