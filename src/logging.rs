//! Logging initialisation and collection timing.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{TelemetryError, TelemetryResult};

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> TelemetryResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| TelemetryError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| TelemetryError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            // Compact is the default on constrained devices
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| TelemetryError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "telemetry::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// Report Timer
// ----------------------------------------------------------------------------

/// Measures one collection cycle of a profile.
#[derive(Debug)]
pub struct ReportTimer {
    profile: String,
    start: Instant,
    threshold_ms: u64,
}

impl ReportTimer {
    /// Start a timer with a warning threshold
    pub fn start(profile: impl Into<String>, threshold_ms: u64) -> Self {
        Self {
            profile: profile.into(),
            start: Instant::now(),
            threshold_ms,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        if elapsed_ms > self.threshold_ms {
            warn!(
                target: "telemetry::report",
                profile = %self.profile,
                elapsed_ms,
                threshold_ms = self.threshold_ms,
                "Report generation exceeded threshold"
            );
        }

        trace!(
            target: "telemetry::report",
            profile = %self.profile,
            elapsed_ms,
            "Report generation completed"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "compact");
        assert!(config.colors);
    }

    #[test]
    fn test_report_timer_measures_elapsed() {
        let timer = ReportTimer::start("RDKB_Profile", 0);
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.stop();
        assert!(elapsed >= Duration::from_millis(5));
    }
}
