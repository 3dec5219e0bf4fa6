//! Error taxonomy for the agent.
//!
//! Every subsystem has its own error enum; all of them convert into
//! [`TelemetryError`]. None of these errors is fatal to the process: the worst
//! outcome is a skipped collection cycle or a rejected management request.

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Agent Errors
// ----------------------------------------------------------------------------

/// The main error type for the agent.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TelemetryError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            TelemetryError::Config(_) => false,
            TelemetryError::Profile(e) => e.is_recoverable(),
            TelemetryError::Scheduler(e) => e.is_recoverable(),
            TelemetryError::Report(e) => e.is_recoverable(),
            TelemetryError::Delivery(_) => true,
            TelemetryError::Store(_) => true,
            TelemetryError::Io(_) => true,
            TelemetryError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TelemetryError::Config(_) => "config",
            TelemetryError::Profile(_) => "profile",
            TelemetryError::Scheduler(_) => "scheduler",
            TelemetryError::Report(_) => "report",
            TelemetryError::Delivery(_) => "delivery",
            TelemetryError::Store(_) => "store",
            TelemetryError::Io(_) => "io",
            TelemetryError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            TelemetryError::Config(_) => RecoveryHint::FixConfiguration,
            TelemetryError::Profile(e) => e.recovery_hint(),
            TelemetryError::Report(e) => e.recovery_hint(),
            TelemetryError::Delivery(_) => RecoveryHint::RetryNextCycle,
            TelemetryError::Internal(_) => RecoveryHint::AlertOperator,
            _ => RecoveryHint::Skip,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Nothing to do, the request was a no-op
    None,
    /// Payload stays cached and is retried on the next collection cycle
    RetryNextCycle,
    /// Fix the profile or agent configuration
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to agent configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Profile Errors
// ----------------------------------------------------------------------------

/// Errors from profile registry operations and marker updates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Profile '{name}' not found")]
    NotFound { name: String },

    #[error("Profile '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Max profile count reached ({max}), can't add another profile")]
    CapacityExceeded { max: usize },

    #[error("Profile '{name}' is disabled")]
    Disabled { name: String },

    #[error("Event '{event}' doesn't match any marker of profile '{profile}'")]
    UnknownMarker { profile: String, event: String },

    #[error("Marker '{marker}': maximum accumulation reached")]
    AccumulationLimit { marker: String },

    #[error("Invalid profile definition '{name}': {message}")]
    InvalidDefinition { name: String, message: String },
}

impl ProfileError {
    pub fn not_found(name: impl Into<String>) -> Self {
        ProfileError::NotFound { name: name.into() }
    }

    pub fn invalid_definition(name: impl Into<String>, message: impl Into<String>) -> Self {
        ProfileError::InvalidDefinition {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProfileError::InvalidDefinition { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ProfileError::InvalidDefinition { .. } => RecoveryHint::FixConfiguration,
            ProfileError::UnknownMarker { .. } => RecoveryHint::FixConfiguration,
            ProfileError::AlreadyExists { .. } => RecoveryHint::None,
            _ => RecoveryHint::Skip,
        }
    }
}

// ----------------------------------------------------------------------------
// Scheduler Errors
// ----------------------------------------------------------------------------

/// Errors from timer registration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Profile '{name}' is already registered with the scheduler")]
    AlreadyRegistered { name: String },

    /// Reported by `unregister` for an absent profile; callers log and move on.
    #[error("Profile '{name}' already removed from the scheduler")]
    NotRegistered { name: String },

    #[error("Failed to spawn timer thread for '{name}': {message}")]
    ThreadSpawnFailed { name: String, message: String },
}

impl SchedulerError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SchedulerError::ThreadSpawnFailed { .. })
    }
}

// ----------------------------------------------------------------------------
// Report Errors
// ----------------------------------------------------------------------------

/// Errors that abort one collection cycle of a profile
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Unsupported encoding format: {encoding}")]
    UnsupportedEncoding { encoding: String },

    #[error("Only JSON name-value pair format is supported, got '{format}'")]
    UnsupportedFormat { format: String },

    #[error("Unsupported report send protocol: {protocol}")]
    UnsupportedProtocol { protocol: String },

    #[error("Profile '{profile}' has no HTTP destination")]
    MissingDestination { profile: String },

    #[error("Unable to generate report for '{profile}': {message}")]
    Serialization { profile: String, message: String },

    #[error("Report for '{profile}' could not be delivered: {source}")]
    Delivery {
        profile: String,
        #[source]
        source: DeliveryError,
    },
}

impl ReportError {
    /// Configuration problems only go away when the profile is replaced
    pub fn is_unsupported_config(&self) -> bool {
        matches!(
            self,
            ReportError::UnsupportedEncoding { .. }
                | ReportError::UnsupportedFormat { .. }
                | ReportError::UnsupportedProtocol { .. }
                | ReportError::MissingDestination { .. }
        )
    }

    pub fn is_recoverable(&self) -> bool {
        !self.is_unsupported_config()
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        if self.is_unsupported_config() {
            RecoveryHint::FixConfiguration
        } else {
            RecoveryHint::RetryNextCycle
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Errors
// ----------------------------------------------------------------------------

/// Transient failures of a single delivery attempt
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Interface '{interface}' has no usable address")]
    InterfaceUnavailable { interface: String },

    #[error("Invalid destination URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("HTTP request failed: {message}")]
    Request { message: String },

    #[error("HTTP error {status_code}")]
    Status { status_code: u16 },
}

impl DeliveryError {
    pub fn request(message: impl Into<String>) -> Self {
        DeliveryError::Request {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Store Errors
// ----------------------------------------------------------------------------

/// Errors from the persisted profile store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for agent operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Result type for registry and marker operations
pub type ProfileResult<T> = Result<T, ProfileError>;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Result type for one collection cycle
pub type ReportResult<T> = Result<T, ReportError>;

/// Result type for a single delivery attempt
pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_config_is_not_recoverable() {
        let err = ReportError::UnsupportedFormat {
            format: "ObjectHierarchy".into(),
        };
        assert!(err.is_unsupported_config());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);

        let wrapped: TelemetryError = err.into();
        assert!(!wrapped.is_recoverable());
        assert_eq!(wrapped.category(), "report");
    }

    #[test]
    fn test_delivery_failure_degrades_to_retry() {
        let err = ReportError::Delivery {
            profile: "RDKB_Profile".into(),
            source: DeliveryError::Status { status_code: 503 },
        };
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryNextCycle);
        assert!(err.to_string().contains("RDKB_Profile"));
    }

    #[test]
    fn test_accumulation_limit_message() {
        let err = ProfileError::AccumulationLimit {
            marker: "SYS_INFO_boot".into(),
        };
        assert!(err.to_string().contains(crate::MAX_ACCUMULATE_MSG));
    }
}
