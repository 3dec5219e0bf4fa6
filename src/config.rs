//! Agent configuration.
//!
//! Loaded from a TOML file with `TELEMETRY_`-prefixed environment overrides
//! (`__` separates nested keys, e.g. `TELEMETRY_HTTP__INTERFACE=erouter0`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cache::MIN_CACHE_CAPACITY;
use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::{
    DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_EVENT_SOCKET_PATH, DEFAULT_HTTP_TIMEOUT_SECS,
    DEFAULT_LOG_DIR, DEFAULT_MAX_REPORT_SIZE, DEFAULT_PROFILE_STORE_DIR, MAX_ACCUMULATE,
    MAX_CACHED_REPORTS, MAX_PROFILES,
};

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Registry limits and paths
    #[serde(default)]
    pub agent: GeneralConfig,

    /// Report delivery settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Grep-marker log scanning
    #[serde(default)]
    pub log_scan: LogScanConfig,

    /// Values served by the built-in parameter source
    #[serde(default)]
    pub device_parameters: BTreeMap<String, String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TELEMETRY_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_profiles == 0 {
            return Err(ConfigError::invalid_value(
                "agent.max_profiles",
                "at least one profile must be allowed",
            ));
        }

        // Eviction drops the entry at index (capacity - 3)
        if self.agent.max_cached_reports < MIN_CACHE_CAPACITY {
            return Err(ConfigError::invalid_value(
                "agent.max_cached_reports",
                "report cache needs room for at least 3 entries",
            ));
        }

        if self.agent.max_accumulate == 0 {
            return Err(ConfigError::invalid_value(
                "agent.max_accumulate",
                "accumulate markers need at least one slot",
            ));
        }

        if self.agent.event_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "agent.event_queue_capacity",
                "event queue must hold at least one event",
            ));
        }

        if self.http.timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "http.timeout",
                "delivery timeout must be non-zero",
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General Agent Configuration
// ----------------------------------------------------------------------------

/// Registry limits and on-disk locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Agent instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Directory holding one persisted configuration per profile
    #[serde(default = "default_profile_store_dir")]
    pub profile_store_dir: PathBuf,

    /// Maximum number of profiles
    #[serde(default = "default_max_profiles")]
    pub max_profiles: usize,

    /// Failed reports cached per profile
    #[serde(default = "default_max_cached_reports")]
    pub max_cached_reports: usize,

    /// Advisory report size limit in bytes
    #[serde(default = "default_max_report_size")]
    pub max_report_size: usize,

    /// Values kept per ACCUMULATE marker between reports
    #[serde(default = "default_max_accumulate")]
    pub max_accumulate: usize,

    /// Capacity of the event-ingestion queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Unix socket accepting `marker=value` event lines
    #[serde(default = "default_event_socket")]
    pub event_socket: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            profile_store_dir: default_profile_store_dir(),
            max_profiles: default_max_profiles(),
            max_cached_reports: default_max_cached_reports(),
            max_report_size: default_max_report_size(),
            max_accumulate: default_max_accumulate(),
            event_queue_capacity: default_event_queue_capacity(),
            event_socket: default_event_socket(),
        }
    }
}

fn default_instance_name() -> String {
    "telemetry-agent".into()
}

fn default_profile_store_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PROFILE_STORE_DIR)
}

fn default_max_profiles() -> usize {
    MAX_PROFILES
}

fn default_max_cached_reports() -> usize {
    MAX_CACHED_REPORTS
}

fn default_max_report_size() -> usize {
    DEFAULT_MAX_REPORT_SIZE
}

fn default_max_accumulate() -> usize {
    MAX_ACCUMULATE
}

fn default_event_queue_capacity() -> usize {
    DEFAULT_EVENT_QUEUE_CAPACITY
}

fn default_event_socket() -> PathBuf {
    PathBuf::from(DEFAULT_EVENT_SOCKET_PATH)
}

// ----------------------------------------------------------------------------
// HTTP Delivery Configuration
// ----------------------------------------------------------------------------

/// Report delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Timeout of a single delivery attempt
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Network interface the upload is bound to
    #[serde(default)]
    pub interface: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            interface: None,
        }
    }
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// Log Scan Configuration
// ----------------------------------------------------------------------------

/// Where grep markers find their log files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogScanConfig {
    /// Base directory for relative log file names
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for LogScanConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();

        assert_eq!(config.agent.max_profiles, MAX_PROFILES);
        assert_eq!(config.agent.max_cached_reports, MAX_CACHED_REPORTS);
        assert_eq!(config.http.timeout, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
        assert!(config.http.interface.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = AgentConfig::from_toml_str(
            r#"
            [agent]
            max_profiles = 4
            max_cached_reports = 8

            [http]
            timeout = "5s"
            interface = "erouter0"

            [device_parameters]
            "Device.DeviceInfo.ModelName" = "TG3482G"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.max_profiles, 4);
        assert_eq!(config.agent.max_cached_reports, 8);
        assert_eq!(config.http.timeout, Duration::from_secs(5));
        assert_eq!(config.http.interface.as_deref(), Some("erouter0"));
        assert_eq!(
            config.device_parameters.get("Device.DeviceInfo.ModelName").map(String::as_str),
            Some("TG3482G")
        );
    }

    #[test]
    fn test_config_rejects_tiny_cache() {
        let err = AgentConfig::from_toml_str("[agent]\nmax_cached_reports = 2\n").unwrap_err();
        assert!(err.to_string().contains("agent.max_cached_reports"));
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_config_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.toml");
        std::fs::write(&path, "[log_scan]\nlog_dir = \"/var/log\"\n").unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.log_scan.log_dir, PathBuf::from("/var/log"));
    }

    #[test]
    fn test_default_config_round_trips() {
        let rendered = AgentConfig::generate_default_config();
        let parsed = AgentConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.agent.instance_name, "telemetry-agent");
    }
}
