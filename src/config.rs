//! Configuration for daemonized jobs.
//!
//! A [`DaemonContext`] is resolved once before daemonization starts: explicit
//! overrides win over environment variables, which win over name-derived defaults.
//! Job files (YAML) feed the same overrides from disk.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use strum::{AsRefStr, EnumString};
use tracing::level_filters::LevelFilter;

use crate::{
    constants::{
        DEFAULT_SLEEP_INTERVAL, LOG_DIR_NAME, LOG_FILE_ENV, LOG_FILE_EXTENSION,
        LOG_LEVEL_ENV, PID_DIR_NAME, PID_FILE_ENV, PID_FILE_EXTENSION,
        SLEEP_INTERVAL_ENV,
    },
    error::ConfigError,
    runtime::RuntimeContext,
};

/// Immutable settings for one daemonized job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonContext {
    name: String,
    pid_file: PathBuf,
    log_file: PathBuf,
    log_level: LevelFilter,
    sleep_interval: Duration,
}

impl DaemonContext {
    /// Starts a builder for a job called `name`.
    pub fn builder(name: impl Into<String>) -> DaemonContextBuilder {
        DaemonContextBuilder {
            name: name.into(),
            runtime: None,
            pid_file: None,
            log_file: None,
            log_level: None,
            sleep_interval: None,
        }
    }

    /// Process name shown by `ps`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PID file path.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Log sink path.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Maximum verbosity written to the log sink.
    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    /// Pause between loop-forever iterations.
    pub fn sleep_interval(&self) -> Duration {
        self.sleep_interval
    }
}

/// Builder for [`DaemonContext`].
#[derive(Debug, Clone)]
pub struct DaemonContextBuilder {
    name: String,
    runtime: Option<RuntimeContext>,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    log_level: Option<LevelFilter>,
    sleep_interval: Option<Duration>,
}

impl DaemonContextBuilder {
    /// Uses an explicit runtime context instead of reading it from the environment.
    pub fn runtime(mut self, runtime: RuntimeContext) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Overrides the PID file path.
    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Overrides the log file path.
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Overrides the log level.
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Overrides the loop-forever sleep interval.
    pub fn sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = Some(interval);
        self
    }

    /// Applies the optional settings of a job file.
    pub fn job_file(mut self, job: &JobFile) -> Result<Self, ConfigError> {
        let base = job.base_dir.clone().unwrap_or_default();
        if let Some(path) = &job.pid_file {
            self.pid_file = Some(resolve_relative(&base, path));
        }
        if let Some(path) = &job.log_file {
            self.log_file = Some(resolve_relative(&base, path));
        }
        if let Some(level) = &job.log_level {
            self.log_level = Some(parse_level(level)?);
        }
        if let Some(secs) = job.sleep_interval {
            self.sleep_interval = Some(seconds_to_duration(secs, &secs.to_string())?);
        }
        Ok(self)
    }

    /// Resolves every field.
    pub fn build(self) -> Result<DaemonContext, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("job name cannot be empty".into()));
        }

        let runtime = self.runtime.unwrap_or_else(RuntimeContext::from_env);

        let pid_file = match self.pid_file.or_else(|| env_path(PID_FILE_ENV)) {
            Some(path) => path,
            None => runtime
                .root
                .join(PID_DIR_NAME)
                .join(format!("{}.{}", self.name, PID_FILE_EXTENSION)),
        };

        let log_file = match self.log_file.or_else(|| env_path(LOG_FILE_ENV)) {
            Some(path) => path,
            None => runtime
                .root
                .join(LOG_DIR_NAME)
                .join(format!("{}.{}", self.name, LOG_FILE_EXTENSION)),
        };

        let log_level = match self.log_level {
            Some(level) => level,
            None => match env::var(LOG_LEVEL_ENV) {
                Ok(raw) => parse_level(&raw)?,
                Err(_) => runtime.mode.default_log_level(),
            },
        };

        let sleep_interval = match self.sleep_interval {
            Some(interval) => interval,
            None => match env::var(SLEEP_INTERVAL_ENV) {
                Ok(raw) => parse_seconds(&raw)?,
                Err(_) => DEFAULT_SLEEP_INTERVAL,
            },
        };

        Ok(DaemonContext {
            name: self.name,
            pid_file,
            log_file,
            log_level,
            sleep_interval,
        })
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn resolve_relative(base: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

/// Parses a log level name (`info`, `DEBUG`, ...).
pub fn parse_level(raw: &str) -> Result<LevelFilter, ConfigError> {
    LevelFilter::from_str(raw.trim())
        .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", raw.trim())))
}

fn parse_seconds(raw: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = raw.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!("sleep interval '{}' is not a number", raw.trim()))
    })?;
    seconds_to_duration(secs, raw.trim())
}

fn seconds_to_duration(secs: f64, raw: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        ConfigError::Invalid(format!(
            "sleep interval '{raw}' must be a non-negative number"
        ))
    })
}

/// How a job's unit of work is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobMode {
    /// Run the unit of work exactly once.
    #[default]
    Once,
    /// Run the unit of work forever, sleeping between iterations.
    Loop,
}

/// On-disk description of a job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    /// Job name; becomes the process name and the default file stem.
    pub name: String,
    /// Shell command executed as the unit of work.
    pub command: String,
    /// Repetition pattern.
    #[serde(default)]
    pub mode: JobMode,
    /// Worker pool size. Absent means a single daemon without a supervisor.
    pub workers: Option<usize>,
    /// Loop-forever pause, in seconds.
    pub sleep_interval: Option<f64>,
    /// PID file path, relative to the job file.
    pub pid_file: Option<String>,
    /// Log file path, relative to the job file.
    pub log_file: Option<String>,
    /// Log level name.
    pub log_level: Option<String>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Expands `$VAR` and `${VAR}` references within a string. `$$` is a literal
/// `$`, left for the shell that runs the command.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\$|\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let Some(var_name) = caps.get(1).map(|m| m.as_str()) else {
            return "$".to_string();
        };
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ConfigError::Invalid(format!(
            "missing environment variable: {var_name}"
        ))),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses a job file, expanding environment variables.
pub fn load_job_file(path: &Path) -> Result<JobFile, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let mut job: JobFile = serde_yaml::from_str(&expanded)?;

    if job.command.trim().is_empty() {
        return Err(ConfigError::Invalid("job command cannot be empty".into()));
    }
    if job.workers == Some(0) {
        return Err(ConfigError::Invalid("workers must be at least 1".into()));
    }

    job.base_dir = Some(
        path.parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf(),
    );
    Ok(job)
}
