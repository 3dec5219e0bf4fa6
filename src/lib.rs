//! # Telemetry Agent
//!
//! On-device telemetry agent for network/media gateways. The agent keeps a set
//! of named reporting profiles, each describing what to collect (data-model
//! parameters, log-derived counters, component events), how to encode it and
//! when to send it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            TELEMETRY AGENT                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  PROFILE REGISTRY → SCHEDULER (1 timer / profile) → REPORT ENGINE → HTTP  │
//! │         ↑                                                 │               │
//! │  EVENT RECEIVER → MARKER STORE ───────────────────────────┘  RETRY CACHE  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`ProfileRegistry`] owns the profile set behind one mutex and enforces at
//!   most one in-flight report per profile.
//! - [`TimerScheduler`] runs one timer thread per enabled profile and calls back
//!   into the registry by profile name.
//! - [`report::collect_and_report`] builds, encodes and delivers one report and
//!   manages the bounded [`ReportCache`] of failed payloads.
//! - Collaborators (parameter source, log scanner, transport, persistence,
//!   event ingestion) are traits in [`sources`] so tests can substitute stubs.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod marker;
pub mod profile;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod sources;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::ReportCache;
pub use config::AgentConfig;
pub use error::{
    ConfigError, DeliveryError, ProfileError, ReportError, SchedulerError, StoreError,
    TelemetryError, TelemetryResult,
};
pub use events::EventReceiver;
pub use marker::{EventMarker, GrepMarker, MarkerKind, MarkerValue};
pub use profile::{EncodingType, HttpDestination, JsonFormat, Param, Profile, Protocol, StaticParam};
pub use registry::{Collaborators, ProfileRegistry, RegistryLimits};
pub use report::ReportOutcome;
pub use scheduler::{ProfileScheduler, ScheduleListener, TimerScheduler};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Agent version - follows semantic versioning
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "telemetry-agent";
pub const AGENT_FULL_NAME: &str = "Gateway Telemetry Agent";

// ----------------------------------------------------------------------------
// Profile & Report Limits
// ----------------------------------------------------------------------------

/// Maximum number of profiles the registry accepts
pub const MAX_PROFILES: usize = 10;

/// Failed reports retained per profile for later retry
pub const MAX_CACHED_REPORTS: usize = 5;

/// Advisory report size limit (bytes); larger reports are still sent
pub const DEFAULT_MAX_REPORT_SIZE: usize = 51_200;

/// Maximum values kept by an ACCUMULATE event marker between reports
pub const MAX_ACCUMULATE: usize = 20;

/// Message carried by the accumulation-limit condition
pub const MAX_ACCUMULATE_MSG: &str = "maximum accumulation reached";

/// Top-level array field of every encoded report
pub const REPORT_ARRAY_FIELD: &str = "Report";

// ----------------------------------------------------------------------------
// Timing & Delivery
// ----------------------------------------------------------------------------

/// Default timeout for a single HTTP delivery attempt (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Collection time above which the report timer logs a warning (milliseconds)
pub const SLOW_REPORT_THRESHOLD_MS: u64 = 10_000;

/// Default capacity of the event-ingestion queue
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 4096;

// ----------------------------------------------------------------------------
// Filesystem Defaults
// ----------------------------------------------------------------------------

/// Default directory of persisted profile configurations
pub const DEFAULT_PROFILE_STORE_DIR: &str = "/nvram/.t2reportprofiles";

/// Default base directory for grep-marker log files
pub const DEFAULT_LOG_DIR: &str = "/rdklogs/logs";

/// Default unix socket accepting `marker=value` event lines
pub const DEFAULT_EVENT_SOCKET_PATH: &str = "/tmp/telemetry-events.sock";
