//! conduitd.toml settings parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Directory holding builtin connector descriptors.
    pub connectors_dir: Option<PathBuf>,
    pub lifecycle: LifecycleSettings,
    pub supervisor: SupervisorSettings,
    pub liveness: LivenessSettings,
    pub workers: WorkerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// How long a caller waits before getting a timeout.
    pub operation_timeout: String,
    pub max_parallelism: u32,
    /// Largest package accepted inline or fetched from a url.
    pub max_package_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub start_attempts: u32,
    pub teardown_attempts: u32,
    pub initial_backoff: String,
    pub max_backoff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    pub interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker node names instances are spread across.
    pub nodes: Vec<String>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            operation_timeout: "30s".to_string(),
            max_parallelism: 64,
            max_package_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            start_attempts: 3,
            teardown_attempts: 3,
            initial_backoff: "200ms".to_string(),
            max_backoff: "5s".to_string(),
        }
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            nodes: vec!["local".to_string()],
        }
    }
}

impl DaemonSettings {
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: DaemonSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that every duration parses and the numeric limits make sense.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.operation_timeout()?;
        self.initial_backoff()?;
        self.max_backoff()?;
        self.liveness_interval()?;
        if self.lifecycle.max_package_bytes == 0 {
            return Err(SettingsError::Invalid(
                "lifecycle.max_package_bytes must be positive".to_string(),
            ));
        }
        if self.lifecycle.max_parallelism == 0 {
            return Err(SettingsError::Invalid(
                "lifecycle.max_parallelism must be positive".to_string(),
            ));
        }
        if self.supervisor.start_attempts == 0 || self.supervisor.teardown_attempts == 0 {
            return Err(SettingsError::Invalid(
                "supervisor attempts must be positive".to_string(),
            ));
        }
        if self.workers.nodes.is_empty() {
            return Err(SettingsError::Invalid(
                "workers.nodes must list at least one node".to_string(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Result<Duration, SettingsError> {
        field_duration("lifecycle.operation_timeout", &self.lifecycle.operation_timeout)
    }

    pub fn initial_backoff(&self) -> Result<Duration, SettingsError> {
        field_duration("supervisor.initial_backoff", &self.supervisor.initial_backoff)
    }

    pub fn max_backoff(&self) -> Result<Duration, SettingsError> {
        field_duration("supervisor.max_backoff", &self.supervisor.max_backoff)
    }

    pub fn liveness_interval(&self) -> Result<Duration, SettingsError> {
        field_duration("liveness.interval", &self.liveness.interval)
    }
}

fn field_duration(field: &'static str, value: &str) -> Result<Duration, SettingsError> {
    parse_duration(value).ok_or_else(|| SettingsError::Duration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
