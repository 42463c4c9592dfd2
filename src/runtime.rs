//! Deployment mode and root directory resolution.
use std::{env, path::PathBuf};

use strum::{AsRefStr, EnumString};
use tracing::level_filters::LevelFilter;

use crate::constants::{DEPLOYMENT_ENV, ROOT_ENV};

/// Where a job is deployed. Decides the default log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeploymentMode {
    /// Production deployment (`info` logging).
    Production,
    /// Local development (`debug` logging).
    #[default]
    Development,
    /// Test runs (`debug` logging).
    Test,
}

impl DeploymentMode {
    /// Reads the mode from `BACKJOB_ENV`, falling back to development.
    pub fn from_env() -> Self {
        env::var(DEPLOYMENT_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or_default()
    }

    /// Log level used when nothing overrides it.
    pub fn default_log_level(&self) -> LevelFilter {
        match self {
            DeploymentMode::Production => LevelFilter::INFO,
            DeploymentMode::Development | DeploymentMode::Test => LevelFilter::DEBUG,
        }
    }
}

/// Process-scoped runtime facts captured once and passed around explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    /// Deployment mode.
    pub mode: DeploymentMode,
    /// Directory default `tmp/` and `log/` paths hang off.
    pub root: PathBuf,
}

impl RuntimeContext {
    /// Captures the runtime context from the environment.
    pub fn from_env() -> Self {
        let root = env::var_os(ROOT_ENV)
            .map(PathBuf::from)
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            mode: DeploymentMode::from_env(),
            root,
        }
    }

    /// Builds a context rooted at an explicit directory.
    pub fn new(mode: DeploymentMode, root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            root: root.into(),
        }
    }
}
