//! Global configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::cas::compress::DEFAULT_ZSTD_LEVEL;
use crate::checkpoint::IgnoreList;
use crate::orchestrator::service::DEFAULT_PROJECT_PATH_ENV;
use crate::orchestrator::supervisor::{SupervisorConfig, DEFAULT_MAX_CONCURRENT_SESSIONS};
use crate::stream::DEFAULT_MAX_RECORD_BYTES;
use crate::{AppError, Result};

/// Environment variable overriding `store_root`.
pub const STORE_ROOT_ENV: &str = "AGENT_TIMELINE_STORE_ROOT";

/// Resource limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LimitsConfig {
    /// Maximum number of sessions not yet in a terminal state.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Bound on a single output record before it is discarded.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

fn default_max_concurrent_sessions() -> usize {
    DEFAULT_MAX_CONCURRENT_SESSIONS
}

fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

/// Process and registry timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Window between `SIGTERM` and `SIGKILL` on cancel.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Per-session deadline; 0 means no deadline.
    #[serde(default)]
    pub session_timeout_seconds: u64,
    /// How long terminal sessions remain queryable.
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: default_cancel_grace_ms(),
            session_timeout_seconds: 0,
            retention_seconds: default_retention_seconds(),
        }
    }
}

fn default_cancel_grace_ms() -> u64 {
    5000
}

fn default_retention_seconds() -> u64 {
    300
}

/// When checkpoints are taken without an explicit request.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    /// Only on request.
    #[default]
    Manual,
    /// Also whenever a session reaches a terminal state.
    OnExit,
}

/// Checkpoint capture settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Glob patterns excluded from snapshots and left alone by restore.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    /// zstd level for new objects.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Automatic checkpoint policy.
    #[serde(default)]
    pub strategy: CheckpointStrategy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ignore: default_ignore(),
            compression_level: default_compression_level(),
            strategy: CheckpointStrategy::default(),
        }
    }
}

fn default_ignore() -> Vec<String> {
    vec![".git".into(), "target".into(), "node_modules".into()]
}

fn default_compression_level() -> i32 {
    DEFAULT_ZSTD_LEVEL
}

fn default_host_cli() -> String {
    "claude".into()
}

fn default_output_format_args() -> Vec<String> {
    vec![
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ]
}

fn default_project_path_env() -> String {
    DEFAULT_PROJECT_PATH_ENV.into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the shared object store and project timelines.
    pub store_root: PathBuf,
    /// Host CLI binary (e.g., `claude`).
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Default arguments for the host CLI.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Arguments requesting line-delimited structured output.
    #[serde(default = "default_output_format_args")]
    pub output_format_args: Vec<String>,
    /// Variable carrying the working directory into the child.
    #[serde(default = "default_project_path_env")]
    pub project_path_env: String,
    /// Directory for daily JSONL lifecycle event logs; disabled when unset.
    #[serde(default)]
    pub events_log_dir: Option<PathBuf>,
    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Timing configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Checkpoint settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl GlobalConfig {
    /// Load, apply environment overrides and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace `store_root` with `AGENT_TIMELINE_STORE_ROOT` when it is set
    /// and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Some(root) = env::var_os(STORE_ROOT_ENV).filter(|v| !v.is_empty()) {
            self.store_root = PathBuf::from(root);
            info!(store_root = %self.store_root.display(), "store root overridden from environment");
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.store_root.as_os_str().is_empty() {
            return Err(AppError::Config("store_root must not be empty".into()));
        }
        if self.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }
        if self.limits.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "limits.max_concurrent_sessions must be greater than zero".into(),
            ));
        }
        if self.limits.max_record_bytes == 0 {
            return Err(AppError::Config(
                "limits.max_record_bytes must be greater than zero".into(),
            ));
        }
        if !(1..=22).contains(&self.checkpoint.compression_level) {
            return Err(AppError::Config(format!(
                "checkpoint.compression_level must be within 1..=22, got {}",
                self.checkpoint.compression_level
            )));
        }
        if self.project_path_env.is_empty() || self.project_path_env.contains('=') {
            return Err(AppError::Config(
                "project_path_env must be a non-empty variable name".into(),
            ));
        }
        Ok(())
    }

    /// Supervisor settings derived from the limits and timeouts.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            cancel_grace: Duration::from_millis(self.timeouts.cancel_grace_ms),
            session_timeout: (self.timeouts.session_timeout_seconds > 0)
                .then(|| Duration::from_secs(self.timeouts.session_timeout_seconds)),
            max_concurrent_sessions: self.limits.max_concurrent_sessions,
            max_record_bytes: self.limits.max_record_bytes,
        }
    }

    /// Compiled checkpoint ignore list.
    #[must_use]
    pub fn ignore_list(&self) -> IgnoreList {
        IgnoreList::new(&self.checkpoint.ignore)
    }
}
