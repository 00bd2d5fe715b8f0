use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub binaries: BinaryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Launch proxies with allocator junk filling turned on
    #[serde(default = "default_junk_fill")]
    pub junk_fill: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            binaries: BinaryConfig::default(),
            timeouts: TimeoutConfig::default(),
            junk_fill: default_junk_fill(),
        }
    }
}

/// Locations of the executables under test. Resolving them is the caller's job.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BinaryConfig {
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub mock_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_noreply_wait_ms")]
    pub noreply_wait_ms: u64,
    #[serde(default = "default_stats_wait_ms")]
    pub stats_wait_ms: u64,
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_connect_deadline_secs")]
    pub connect_deadline_secs: Option<u64>,
    #[serde(default = "default_terminate_timeout_secs")]
    pub terminate_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            noreply_wait_ms: default_noreply_wait_ms(),
            stats_wait_ms: default_stats_wait_ms(),
            connect_retry_ms: default_connect_retry_ms(),
            connect_deadline_secs: default_connect_deadline_secs(),
            terminate_timeout_secs: default_terminate_timeout_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn noreply_wait(&self) -> Duration {
        Duration::from_millis(self.noreply_wait_ms)
    }

    pub fn stats_wait(&self) -> Duration {
        Duration::from_millis(self.stats_wait_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn connect_deadline(&self) -> Option<Duration> {
        self.connect_deadline_secs.map(Duration::from_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

fn default_junk_fill() -> bool {
    true
}
fn default_noreply_wait_ms() -> u64 {
    500
}
fn default_stats_wait_ms() -> u64 {
    2000
}
fn default_connect_retry_ms() -> u64 {
    10
}
fn default_connect_deadline_secs() -> Option<u64> {
    Some(30)
}
fn default_terminate_timeout_secs() -> u64 {
    10
}

impl HarnessConfig {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        if t.noreply_wait_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts.noreply_wait_ms must be greater than zero".to_string(),
            ));
        }
        if t.stats_wait_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts.stats_wait_ms must be greater than zero".to_string(),
            ));
        }
        if t.terminate_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts.terminate_timeout_secs must be greater than zero".to_string(),
            ));
        }
        for (name, path) in [
            ("proxy", &self.binaries.proxy),
            ("mock_server", &self.binaries.mock_server),
        ] {
            if matches!(path, Some(p) if p.trim().is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "binaries.{} must not be empty",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn proxy_binary(&self) -> Result<&str, ConfigError> {
        self.binaries
            .proxy
            .as_deref()
            .ok_or_else(|| ConfigError::MissingBinary("proxy".to_string()))
    }

    pub fn mock_server_binary(&self) -> Result<&str, ConfigError> {
        self.binaries
            .mock_server
            .as_deref()
            .ok_or_else(|| ConfigError::MissingBinary("mock_server".to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("No {0} binary configured")]
    MissingBinary(String),
}
