//! Configuration for the NeuroFocus agent.

use crate::core::{ChannelGrouping, FocusFormula};
use crate::recording::Precision;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Board or remote server to read from
    pub session: SessionConfig,

    /// Interval between feature ticks
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Refresh cadence of the live display
    #[serde(with = "duration_millis")]
    pub display_refresh: Duration,

    /// Request timeout when polling a remote feature server
    #[serde(with = "duration_millis")]
    pub remote_timeout: Duration,

    pub focus_formula: FocusFormula,

    /// Whether records carry a relaxation index
    pub emit_relaxation: bool,

    pub channel_grouping: ChannelGrouping,

    /// Decimal places in recordings
    pub precision: Precision,

    /// Directory for CSV recordings
    pub recording_path: PathBuf,

    /// Path for diagnostics and other state
    pub data_path: PathBuf,

    /// Port of the feature server
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("neurofocus-agent");

        Self {
            session: SessionConfig::default(),
            tick_interval: Duration::from_millis(1000),
            display_refresh: Duration::from_millis(33),
            remote_timeout: Duration::from_millis(1000),
            focus_formula: FocusFormula::V1,
            emit_relaxation: true,
            channel_grouping: ChannelGrouping::PerChannel,
            precision: Precision::default(),
            recording_path: data_dir.join("recordings"),
            data_path: data_dir,
            server_port: 5000,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("neurofocus-agent")
            .join("config.json")
    }

    /// Path of the persisted diagnostics.
    pub fn diagnostics_path(&self) -> PathBuf {
        self.data_path.join("diagnostics.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.recording_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be positive".into()));
        }
        if session.sampling_rate == 0 {
            return Err(ConfigError::Invalid("sampling_rate must be positive".into()));
        }
        if session.channel_count == 0 {
            return Err(ConfigError::Invalid("channel_count must be positive".into()));
        }
        if let Some(c) = session
            .channels
            .iter()
            .find(|&&c| c >= session.channel_count)
        {
            return Err(ConfigError::Invalid(format!(
                "channel {c} is outside the board's {} channels",
                session.channel_count
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serde support for durations stored as whole milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
