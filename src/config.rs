//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::budget::Budget;
use crate::{AppError, Result};

/// Dependency scheduler defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Concurrency cap for groups created without an explicit one.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: u32,
    /// Whether a single failed spec fails the whole group.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: default_max_concurrent(),
            fail_fast: false,
        }
    }
}

/// Command queue executor defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Whether a failed command fails the queue (`true`) or is skipped past.
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
        }
    }
}

/// Update bridge polling settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Delay between `receive()` calls on a transcript source.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Replay already-observed events to late subscribers.
    #[serde(default = "default_true")]
    pub include_existing: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            include_existing: true,
        }
    }
}

impl BridgeConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Push-transport reconnect backoff.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts before the transport gives up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Process launcher settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LauncherConfig {
    /// Seconds to wait after SIGTERM before force-killing a session.
    #[serde(default = "default_terminate_grace_seconds")]
    pub terminate_grace_seconds: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            terminate_grace_seconds: default_terminate_grace_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_terminate_grace_seconds() -> u64 {
    5
}

fn default_http_port() -> u16 {
    3000
}

fn default_ipc_name() -> String {
    "agent-conductor".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Project root used when a request omits one; also anchors the database.
    pub default_project_root: PathBuf,
    /// Explicit database file; defaults to `<root>/.conductor/conductor.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Host CLI binary that executes a session prompt.
    pub host_cli: String,
    /// Arguments passed to the host CLI before the prompt.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// HTTP port for the SSE push transport.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier for the control plane.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Scheduler defaults.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Queue executor defaults.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Update bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Reconnect backoff for push clients.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Budget applied to sessions that carry none of their own.
    #[serde(default)]
    pub budget: Budget,
    /// Process launcher settings.
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved database file path.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            self.default_project_root
                .join(".conductor")
                .join("conductor.db")
        })
    }

    fn validate(&mut self) -> Result<()> {
        if self.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }

        if self.scheduler.default_max_concurrent == 0 {
            return Err(AppError::Config(
                "scheduler.default_max_concurrent must be greater than zero".into(),
            ));
        }

        if self.bridge.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "bridge.poll_interval_ms must be greater than zero".into(),
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(AppError::Config(
                "reconnect.max_attempts must be greater than zero".into(),
            ));
        }

        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(AppError::Config(
                "reconnect.max_delay_ms must not be below base_delay_ms".into(),
            ));
        }

        self.budget
            .validate()
            .map_err(|err| AppError::Config(format!("budget: {err}")))?;

        let canonical_root = self
            .default_project_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("default_project_root invalid: {err}")))?;
        self.default_project_root = canonical_root;

        Ok(())
    }
}
