//! Error handling for backjob.
use std::{error::Error as StdError, path::PathBuf, process::ExitStatus};

use thiserror::Error;

/// Boxed error produced by caller-supplied callbacks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors raised while turning the current process into a daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A PID file already exists at the target path.
    #[error("PID file ({}) exists!", path.display())]
    AlreadyRunning {
        /// Path of the PID file that blocked startup.
        path: PathBuf,
    },

    /// The environment bootstrap failed; startup was aborted.
    #[error("Could not initialize environment: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// A detach-related system call failed.
    #[error("Syscall '{call}' failed: {source}")]
    Syscall {
        /// Name of the failing call (`fork`, `setsid`).
        call: &'static str,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// Filesystem or descriptor error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by the environment bootstrap collaborator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BootstrapError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl BootstrapError {
    /// Creates a bootstrap error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying error as the cause of the bootstrap failure.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// A fault raised by one unit of work. Always recovered by the worker loop.
#[derive(Debug, Error)]
pub enum WorkFault {
    /// The unit of work returned an error.
    #[error("{0}")]
    Failed(BoxError),

    /// The unit of work panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl WorkFault {
    /// Wraps any error value as a work fault.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        WorkFault::Failed(err.into())
    }
}

/// Failures of a shell command run as a unit of work.
#[derive(Debug, Error)]
pub enum JobError {
    /// The shell could not be started.
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        /// Command line handed to the shell.
        command: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Polling the running command failed.
    #[error("Failed to wait for `{command}`: {source}")]
    Wait {
        /// Command line handed to the shell.
        command: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The command ran but did not succeed.
    #[error("`{command}` finished with {status}")]
    Failed {
        /// Command line handed to the shell.
        command: String,
        /// How the command ended.
        status: ExitStatus,
    },
}

/// Errors emitted by the worker pool supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spawning the worker for a slot failed.
    #[error("Failed to spawn worker for slot {slot}: {source}")]
    Spawn {
        /// Slot index that could not be filled.
        slot: usize,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Installing signal handlers failed.
    #[error("Failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// A supervisor was asked to manage zero workers.
    #[error("child count must be at least 1")]
    NoWorkers,
}

/// Errors raised while loading a job file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the job file.
    #[error("Failed to read job file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing YAML.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value was present but unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Error type for PID file inspection.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading the PID file.
    #[error("Failed to read PID file: {0}")]
    Read(#[from] std::io::Error),

    /// The PID file did not contain a decimal PID.
    #[error("PID file {} does not contain a PID", path.display())]
    Malformed {
        /// Offending file.
        path: PathBuf,
    },
}
