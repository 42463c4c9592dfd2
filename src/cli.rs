//! Command-line interface for backjob.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }

    /// The parsed level.
    pub fn level(&self) -> LevelFilter {
        self.0
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" | "fatal" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for backjob.
#[derive(Parser)]
#[command(name = "backjob", version, author)]
#[command(about = "Runs background jobs as daemons and worker pools", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for backjob.
#[derive(Subcommand)]
pub enum Commands {
    /// Daemonize and run a job.
    Run {
        /// Path to a YAML job file.
        #[arg(short, long)]
        config: Option<String>,

        /// Job name (required without a job file).
        #[arg(short, long)]
        name: Option<String>,

        /// Repeat the command forever, sleeping between runs.
        #[arg(long = "loop")]
        loop_forever: bool,

        /// Keep this many worker processes alive under a supervisor.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stay attached to the terminal instead of double-forking.
        #[arg(long)]
        foreground: bool,

        /// Seconds to sleep between loop iterations.
        #[arg(long, value_name = "SECONDS")]
        sleep_interval: Option<f64>,

        /// Seconds between supervisor reap/respawn ticks.
        #[arg(long, value_name = "SECONDS")]
        poll_interval: Option<f64>,

        /// Override the PID file path.
        #[arg(long)]
        pid_file: Option<String>,

        /// Override the log file path.
        #[arg(long)]
        log_file: Option<String>,

        /// Shell command to run (overrides the job file's command).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show whether a job's daemon is running.
    Status {
        /// Path to a YAML job file.
        #[arg(short, long)]
        config: Option<String>,

        /// Job name (required without a job file or PID file).
        #[arg(short, long)]
        name: Option<String>,

        /// Read this PID file instead of the job's default.
        #[arg(long)]
        pid_file: Option<String>,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Ask a job's daemon to shut down.
    Stop {
        /// Path to a YAML job file.
        #[arg(short, long)]
        config: Option<String>,

        /// Job name (required without a job file or PID file).
        #[arg(short, long)]
        name: Option<String>,

        /// Read this PID file instead of the job's default.
        #[arg(long)]
        pid_file: Option<String>,

        /// Seconds to wait for the PID file to disappear.
        #[arg(long, default_value_t = 10.0, value_name = "SECONDS")]
        timeout: f64,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
