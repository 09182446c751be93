//! Runtime configuration.
//!
//! Defaults can be overridden from a JSON file ([`RlmConfig::load`]) and then
//! from the environment ([`RlmConfig::with_env`]).

use crate::progress::Limits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming the worker executable.
pub const ENV_WORKER_PATH: &str = "RLM_WORKER_PATH";
/// Environment variable overriding the request timeout (milliseconds).
pub const ENV_REQUEST_TIMEOUT_MS: &str = "RLM_REQUEST_TIMEOUT_MS";
/// Environment variable overriding the stop grace period (milliseconds).
pub const ENV_STOP_GRACE_MS: &str = "RLM_STOP_GRACE_MS";
/// Environment variable overriding the step limit.
pub const ENV_MAX_STEPS: &str = "RLM_MAX_STEPS";
/// Environment variable overriding the nesting depth limit.
pub const ENV_MAX_DEPTH: &str = "RLM_MAX_DEPTH";
/// Environment variable overriding the per-step time limit (milliseconds).
pub const ENV_MAX_DURATION_MS: &str = "RLM_MAX_DURATION_MS";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON for [`RlmConfig`].
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

/// How worker processes are launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable; defaults to `rlm-worker` next to the current executable.
    pub program: Option<PathBuf>,
    /// Extra arguments passed to the worker.
    pub args: Vec<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlmConfig {
    /// Worker launch settings.
    pub worker: WorkerConfig,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop, in milliseconds.
    pub stop_grace_ms: u64,
    /// Script limits applied to every run.
    pub limits: Limits,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            request_timeout_ms: 60_000,
            stop_grace_ms: 1_000,
            limits: Limits::default(),
        }
    }
}

impl RlmConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Defaults with process environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Apply process environment overrides.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = lookup(ENV_WORKER_PATH).filter(|path| !path.trim().is_empty()) {
            self.worker.program = Some(PathBuf::from(path));
        }
        if let Some(value) = parse_var(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            self.request_timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_STOP_GRACE_MS)? {
            self.stop_grace_ms = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_STEPS)? {
            self.limits.max_steps = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_DEPTH)? {
            self.limits.max_depth = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_DURATION_MS)? {
            self.limits.max_duration_ms = value;
        }
        Ok(self)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
    }
}
