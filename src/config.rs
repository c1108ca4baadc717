//! Server configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::runtime::trigger::ReloadStrategyConfig;
use crate::supervisor::restart::RestartPolicy;
use crate::supervisor::SupervisorOptions;
use crate::{AppError, Result};

/// Crash-respawn limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestartConfig {
    /// Crash respawns allowed per template inside the window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Sliding window length.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Delay before the first crash respawn.
    #[serde(default = "default_backoff_first_ms")]
    pub backoff_first_ms: u64,
    /// Maximum crash respawn delay.
    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_seconds: default_window_seconds(),
            backoff_first_ms: default_backoff_first_ms(),
            backoff_max_seconds: default_backoff_max_seconds(),
        }
    }
}

fn default_max_restarts() -> u32 {
    5
}

fn default_window_seconds() -> u64 {
    60
}

fn default_backoff_first_ms() -> u64 {
    1000
}

fn default_backoff_max_seconds() -> u64 {
    30
}

/// A worker running an external program.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Unique worker name.
    pub name: String,
    /// Replica count.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Whether replicas receive reload signals.
    #[serde(default = "default_true")]
    pub reloadable: bool,
    /// OS user to run as.
    #[serde(default)]
    pub user: Option<String>,
    /// OS group to run as.
    #[serde(default)]
    pub group: Option<String>,
    /// Command line; no shell is involved.
    pub command: String,
    /// Reload strategies.
    #[serde(default)]
    pub reload_strategies: Vec<ReloadStrategyConfig>,
}

/// A scheduled task running an external program.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PeriodicConfig {
    /// Unique task name.
    pub name: String,
    /// Cron expression (5 or 6 fields) or interval such as `every 30s`.
    pub schedule: String,
    /// Command line; no shell is involved.
    pub command: String,
    /// OS user to run as.
    #[serde(default)]
    pub user: Option<String>,
    /// OS group to run as.
    #[serde(default)]
    pub group: Option<String>,
}

fn default_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Server configuration parsed from a TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Explicit PID file; derived from the executable path when unset.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Grace period between SIGTERM and SIGKILL for each child.
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: u64,
    /// Bound on the whole shutdown; unset waits indefinitely.
    #[serde(default)]
    pub shutdown_timeout_seconds: Option<u64>,
    /// Child heartbeat interval.
    #[serde(default = "default_heartbeat_period_seconds")]
    pub heartbeat_period_seconds: u64,
    /// Missed heartbeat periods before a worker is flagged blocked.
    #[serde(default = "default_blocked_threshold_periods")]
    pub blocked_threshold_periods: u32,
    /// How long a blocked flag persists without a heartbeat.
    #[serde(default = "default_blocked_persistence_seconds")]
    pub blocked_persistence_seconds: u64,
    /// How long `prochive-ctl` waits for a relay answer.
    #[serde(default = "default_relay_timeout_seconds")]
    pub relay_timeout_seconds: u64,
    /// Crash-respawn limits.
    #[serde(default)]
    pub restart: RestartConfig,
    /// External-program workers.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    /// External-program periodic tasks.
    #[serde(default)]
    pub periodic: Vec<PeriodicConfig>,
}

fn default_stop_timeout_seconds() -> u64 {
    15
}

fn default_heartbeat_period_seconds() -> u64 {
    2
}

fn default_blocked_threshold_periods() -> u32 {
    6
}

fn default_blocked_persistence_seconds() -> u64 {
    30
}

fn default_relay_timeout_seconds() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            stop_timeout_seconds: default_stop_timeout_seconds(),
            shutdown_timeout_seconds: None,
            heartbeat_period_seconds: default_heartbeat_period_seconds(),
            blocked_threshold_periods: default_blocked_threshold_periods(),
            blocked_persistence_seconds: default_blocked_persistence_seconds(),
            relay_timeout_seconds: default_relay_timeout_seconds(),
            restart: RestartConfig::default(),
            workers: Vec::new(),
            periodic: Vec::new(),
        }
    }
}

impl ServerConfig {
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

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Child heartbeat interval.
    #[must_use]
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_seconds)
    }

    /// Optional bound on the whole shutdown.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_seconds.map(Duration::from_secs)
    }

    /// Relay answer timeout for control clients.
    #[must_use]
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_seconds)
    }

    /// Supervisor timing derived from this configuration.
    #[must_use]
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            stop_timeout: Duration::from_secs(self.stop_timeout_seconds),
            blocked_threshold: self.heartbeat_period() * self.blocked_threshold_periods,
            blocked_persistence: Duration::from_secs(self.blocked_persistence_seconds),
            restart: RestartPolicy {
                max_restarts: self.restart.max_restarts,
                window: Duration::from_secs(self.restart.window_seconds),
                backoff_first: Duration::from_millis(self.restart.backoff_first_ms),
                backoff_max: Duration::from_secs(self.restart.backoff_max_seconds),
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_period_seconds == 0 {
            return Err(AppError::Config(
                "heartbeat_period_seconds must be greater than zero".into(),
            ));
        }
        if self.blocked_threshold_periods == 0 {
            return Err(AppError::Config(
                "blocked_threshold_periods must be greater than zero".into(),
            ));
        }
        if self.restart.backoff_first_ms == 0 {
            return Err(AppError::Config(
                "restart.backoff_first_ms must be greater than zero".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for name in self
            .workers
            .iter()
            .map(|w| w.name.as_str())
            .chain(self.periodic.iter().map(|p| p.name.as_str()))
        {
            if name.trim().is_empty() {
                return Err(AppError::Config("process names must not be empty".into()));
            }
            if !names.insert(name) {
                return Err(AppError::Config(format!("duplicate process name '{name}'")));
            }
        }

        if let Some(worker) = self.workers.iter().find(|w| w.count == 0) {
            return Err(AppError::Config(format!(
                "worker '{}' must have at least one replica",
                worker.name
            )));
        }

        Ok(())
    }
}
