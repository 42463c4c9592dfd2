//! Backjob turns long-running background jobs into well-behaved Unix daemons.
//! It detaches from the terminal, guards against duplicate instances with a PID
//! file, runs a unit of work once or forever with fault isolation, and can keep
//! a fixed pool of worker processes alive under a supervising master.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants.
pub mod constants;

/// Daemonization sequence and exit handling.
pub mod daemon;

/// Error handling.
pub mod error;

/// Shell commands as units of work.
pub mod job;

/// Log file sink and tracing setup.
pub mod logs;

/// PID file ownership and probing.
pub mod pidfile;

/// Deployment mode and application root.
pub mod runtime;

/// Signal registration.
pub mod signals;

/// Worker pool supervisor.
pub mod supervisor;

/// Once and loop-forever execution of a unit of work.
pub mod worker;

#[doc(hidden)]
pub mod test_utils;
