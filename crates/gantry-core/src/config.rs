//! Execution configuration consumed (not owned) by the engine core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables threaded through executors, the orchestrator, and the
/// runtime supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Budget for one executed command (a whole suite session).
    #[serde(default = "default_session_timeout")]
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Budget for the runtime's staged compile pass.
    #[serde(default = "default_compile_timeout")]
    #[serde(with = "humantime_serde")]
    pub compile_timeout: Duration,

    /// Whether stage output is captured into stdout reports.
    #[serde(default = "default_capture_output")]
    pub capture_output: bool,

    /// Parallelism hint forwarded to embedders; suite runs themselves
    /// are serial per engine instance.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

const fn default_session_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_compile_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_capture_output() -> bool {
    true
}

const fn default_max_parallelism() -> usize {
    1
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            session_timeout: default_session_timeout(),
            compile_timeout: default_compile_timeout(),
            capture_output: default_capture_output(),
            max_parallelism: default_max_parallelism(),
        }
    }
}

impl ExecutionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or `max_parallelism` is
    /// zero.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallelism == 0 {
            return Err(ConfigError::Validation(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read configuration: {0}")]
    Io(std::io::Error),

    /// TOML was invalid.
    #[error("failed to parse configuration: {0}")]
    Parse(toml::de::Error),

    /// Serialization failed.
    #[error("failed to serialize configuration: {0}")]
    Serialize(toml::ser::Error),

    /// A value was out of range.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
