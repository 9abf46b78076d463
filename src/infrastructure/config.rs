//! Configuration management
//!
//! The agent reads one YAML file mirroring this struct tree. Every
//! section carries `#[serde(default)]`, so a partial file only
//! overrides the keys it names and inherits the rest from the
//! defaults. CLI flags are applied on top of the file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::agent::schedule::{ScheduleError, WorkSchedule};
use crate::monitor::MonitorSettings;

/// Configuration that cannot be loaded or does not hold up.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this tree.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The effective config could not be rendered back to YAML.
    #[error("failed to render config: {0}")]
    Render(#[from] serde_yaml::Error),

    /// A value is out of range or otherwise unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The scheduling section does not parse.
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// The single `agent:` section.
    pub agent: AgentSection,
}

/// Everything under the `agent:` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Node identifier; the hostname is used when unset.
    pub node_id: Option<String>,
    /// Server connection settings.
    pub connection: ConnectionSettings,
    /// Admission thresholds and sampling cadence.
    pub resources: ResourceSettings,
    /// Job workspace settings.
    pub processing: ProcessingSettings,
    /// Working-hours restrictions.
    pub scheduling: SchedulingSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            node_id: None,
            connection: ConnectionSettings::default(),
            resources: ResourceSettings::default(),
            processing: ProcessingSettings::default(),
            scheduling: SchedulingSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// How to reach the job server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Base URL of the job server.
    pub server_url: String,
    /// Seconds between heartbeats.
    pub heartbeat_interval_seconds: u64,
    /// Seconds to wait after a failed registration.
    pub registration_backoff_seconds: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_seconds: u64,
    /// Connection establishment timeout in seconds.
    pub connect_timeout_seconds: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            heartbeat_interval_seconds: 60,
            registration_backoff_seconds: 30,
            request_timeout_seconds: 10,
            connect_timeout_seconds: 10,
        }
    }
}

/// Admission thresholds for the resource gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Refuse work above this averaged CPU usage.
    pub max_cpu_percent: f64,
    /// Refuse work above this averaged memory usage.
    pub max_memory_percent: f64,
    /// Refuse work below this much free disk, in MB.
    pub min_free_disk_mb: u64,
    /// Execution slots.
    pub concurrent_jobs: usize,
    /// Seconds between load samples.
    pub sample_interval_seconds: u64,
    /// Samples in the averaging window.
    pub history_size: usize,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 70.0,
            min_free_disk_mb: 1000,
            concurrent_jobs: 2,
            sample_interval_seconds: 5,
            history_size: 12,
        }
    }
}

/// Where jobs get their scratch space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Parent directory for per-job workspaces.
    pub work_dir: PathBuf,
    /// Remove a job's workspace once it finishes.
    pub cleanup_after_job: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("farmhand"),
            cleanup_after_job: true,
        }
    }
}

/// Daily window, `HH:MM` on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingHours {
    /// Window start.
    pub start: String,
    /// Window end; earlier than start means overnight.
    pub end: String,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start: "18:00".to_string(),
            end: "08:00".to_string(),
        }
    }
}

/// When the node accepts new work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSettings {
    /// Restrict job intake to the configured window.
    pub working_hours_only: bool,
    /// The daily window.
    pub working_hours: WorkingHours,
    /// Days on which the window applies.
    pub working_days: Vec<String>,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            working_hours_only: false,
            working_hours: WorkingHours::default(),
            working_days: ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level or filter directive.
    pub level: String,
    /// Also write daily-rotated logs into this directory.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// CLI flags layered over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Replaces `agent.connection.server_url`.
    pub server_url: Option<String>,
    /// Replaces `agent.node_id`.
    pub node_id: Option<String>,
    /// Replaces `agent.processing.work_dir`.
    pub work_dir: Option<PathBuf>,
    /// Replaces `agent.logging.level`.
    pub log_level: Option<String>,
}

impl AgentConfig {
    /// Loads the config file, falling back to defaults when no path is
    /// given or the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` when the file exists but cannot be read
    /// or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Parses the given YAML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies CLI flags on top of the loaded values.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(server_url) = &overrides.server_url {
            self.agent.connection.server_url = server_url.clone();
        }
        if let Some(node_id) = &overrides.node_id {
            self.agent.node_id = Some(node_id.clone());
        }
        if let Some(work_dir) = &overrides.work_dir {
            self.agent.processing.work_dir = work_dir.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.agent.logging.level = level.clone();
        }
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;

        Url::parse(&agent.connection.server_url).map_err(|err| {
            ConfigError::Invalid(format!(
                "server_url '{}' does not parse: {err}",
                agent.connection.server_url
            ))
        })?;

        if agent.connection.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_seconds must be at least 1".to_string(),
            ));
        }
        if agent.resources.concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if agent.resources.sample_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "sample_interval_seconds must be at least 1".to_string(),
            ));
        }
        if agent.resources.history_size == 0 {
            return Err(ConfigError::Invalid(
                "history_size must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("max_cpu_percent", agent.resources.max_cpu_percent),
            ("max_memory_percent", agent.resources.max_memory_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within (0, 100], got {value}"
                )));
            }
        }

        // Surfaces bad day names and window times even when the
        // restriction is currently switched off.
        WorkSchedule::restricted(
            &agent.scheduling.working_hours.start,
            &agent.scheduling.working_hours.end,
            &agent.scheduling.working_days,
        )?;

        Ok(())
    }

    /// Builds the schedule gate for the agent loop.
    ///
    /// # Errors
    ///
    /// Returns a `ScheduleError` when the configured window or day
    /// names do not parse.
    pub fn schedule(&self) -> Result<WorkSchedule, ScheduleError> {
        if !self.agent.scheduling.working_hours_only {
            return Ok(WorkSchedule::unrestricted());
        }
        WorkSchedule::restricted(
            &self.agent.scheduling.working_hours.start,
            &self.agent.scheduling.working_hours.end,
            &self.agent.scheduling.working_days,
        )
    }

    /// Maps the resources section onto the monitor's settings.
    #[must_use]
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            max_cpu_percent: self.agent.resources.max_cpu_percent,
            max_memory_percent: self.agent.resources.max_memory_percent,
            min_free_disk_mb: self.agent.resources.min_free_disk_mb,
            sample_interval: std::time::Duration::from_secs(
                self.agent.resources.sample_interval_seconds,
            ),
            history_size: self.agent.resources.history_size,
        }
    }

    /// Renders the effective configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` when serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
