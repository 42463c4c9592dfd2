//! Constants and default values shared across backjob.
//!
//! Centralizes timings, environment variable names, and path conventions so that
//! the daemon, worker loop, and supervisor agree on them.

use std::time::Duration;

// ============================================================================
// Environment Overrides
// ============================================================================

/// Overrides the PID file path of a daemon.
pub const PID_FILE_ENV: &str = "PID_FILE";

/// Overrides the log file path of a daemon.
pub const LOG_FILE_ENV: &str = "LOG_FILE";

/// Overrides the log level of a daemon (`error`, `warn`, `info`, `debug`, `trace`).
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Overrides the loop-forever sleep interval, in seconds.
pub const SLEEP_INTERVAL_ENV: &str = "SLEEP_INTERVAL";

/// Root directory that default `tmp/` and `log/` paths are resolved against.
pub const ROOT_ENV: &str = "BACKJOB_ROOT";

/// Deployment mode (`production`, `development`, `test`).
pub const DEPLOYMENT_ENV: &str = "BACKJOB_ENV";

/// Slot index exported to workers started by the command spawner.
pub const WORKER_INDEX_ENV: &str = "BACKJOB_WORKER_INDEX";

// ============================================================================
// File System Conventions
// ============================================================================

/// Directory (relative to the root) holding default PID files.
pub const PID_DIR_NAME: &str = "tmp";

/// Directory (relative to the root) holding default log files.
pub const LOG_DIR_NAME: &str = "log";

/// Extension for PID files.
pub const PID_FILE_EXTENSION: &str = "pid";

/// Extension for log files.
pub const LOG_FILE_EXTENSION: &str = "log";

/// Null sink that standard input is attached to after daemonization.
pub const DEV_NULL: &str = "/dev/null";

// ============================================================================
// Timing
// ============================================================================

/// Default pause between loop-forever iterations.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default pause between supervisor reap/respawn ticks.
pub const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Granularity at which long sleeps re-check shutdown and signal flags.
pub const SLEEP_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// Shell Execution
// ============================================================================

/// Shell used to run job commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";
