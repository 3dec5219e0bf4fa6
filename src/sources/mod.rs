//! Collaborator interfaces of the report pipeline.
//!
//! The registry and report engine only talk to the outside world through the
//! traits below. Each has a default implementation used by `telemetryd`:
//!
//! | trait | default |
//! |---|---|
//! | [`ParameterSource`] | [`InMemoryParameterSource`] |
//! | [`LogScanSource`] | [`FileLogScanner`] |
//! | [`ProfileStore`] | [`DirectoryProfileStore`] |
//! | [`ReportTransport`] | [`HttpTransport`] |
//! | [`EventMarkerRegistrar`] | [`crate::events::EventReceiver`] |

use std::collections::BTreeMap;

use crate::error::{DeliveryResult, StoreError};
use crate::marker::GrepMarker;
use crate::profile::Param;

pub mod http;
pub mod logscan;
pub mod params;
pub mod store;

pub use http::HttpTransport;
pub use logscan::FileLogScanner;
pub use params::InMemoryParameterSource;
pub use store::DirectoryProfileStore;

// ----------------------------------------------------------------------------
// Parameter Source
// ----------------------------------------------------------------------------

/// Device data-model access
pub trait ParameterSource: Send + Sync {
    /// Values keyed by parameter reference; unknown references are absent
    fn get_values(&self, params: &[Param]) -> BTreeMap<String, String>;
}

// ----------------------------------------------------------------------------
// Log Scan Source
// ----------------------------------------------------------------------------

/// Grep-marker evaluation over device logs
pub trait LogScanSource: Send + Sync {
    /// `(marker name, value)` pairs for one report.
    ///
    /// `clear_seek_map` makes the scan restart from the beginning of each log.
    fn grep_results(
        &self,
        profile: &str,
        markers: &[GrepMarker],
        clear_seek_map: bool,
    ) -> Vec<(String, String)>;

    /// Called when a profile with grep markers is added
    fn save_grep_config(&self, profile: &str, markers: &[GrepMarker]);

    /// Called when a profile is deleted
    fn remove_grep_config(&self, profile: &str);
}

// ----------------------------------------------------------------------------
// Profile Store
// ----------------------------------------------------------------------------

/// A persisted profile definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConfig {
    pub name: String,
    pub raw: String,
}

/// Persistence of profile definitions across restarts
pub trait ProfileStore: Send + Sync {
    fn fetch_stored_configs(&self) -> Result<Vec<StoredConfig>, StoreError>;

    fn clear_persisted_state(&self) -> Result<(), StoreError>;
}

// ----------------------------------------------------------------------------
// Report Transport
// ----------------------------------------------------------------------------

/// Single-attempt delivery of an encoded report
#[cfg_attr(test, mockall::automock)]
pub trait ReportTransport: Send + Sync {
    fn deliver(&self, url: &str, payload: &[u8], content_type: &str) -> DeliveryResult<()>;
}

// ----------------------------------------------------------------------------
// Event Ingestion
// ----------------------------------------------------------------------------

/// Routing of component events to profile markers
pub trait EventMarkerRegistrar: Send + Sync {
    /// Route `marker` events emitted by `component` to `profile`
    fn arm_event_marker(&self, marker: &str, component: &str, profile: &str, skip_frequency: u32);

    /// Drop every route that targets `profile`
    fn disarm_profile(&self, profile: &str);

    /// Start background dispatch; later calls are no-ops
    fn start_dispatch(&self);
}
