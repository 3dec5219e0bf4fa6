//! Event and grep markers.
//!
//! Event markers are the only profile state written from outside the report
//! cycle: the event-ingestion path stores values through
//! [`EventMarker::store`], and the report engine drains them with
//! [`EventMarker::take_report_entries`]. Grep markers are read-only
//! descriptors; their values come from the log-scan collaborator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProfileError, ProfileResult};

// ----------------------------------------------------------------------------
// Marker Kind & Value
// ----------------------------------------------------------------------------

/// How a marker folds repeated occurrences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    /// One increment per occurrence
    #[serde(alias = "count")]
    Counter,
    /// Last value wins
    Absolute,
    /// Bounded history of values
    Accumulate,
}

impl Default for MarkerKind {
    fn default() -> Self {
        MarkerKind::Counter
    }
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerKind::Counter => write!(f, "counter"),
            MarkerKind::Absolute => write!(f, "absolute"),
            MarkerKind::Accumulate => write!(f, "accumulate"),
        }
    }
}

/// Current value of an event marker, one case per [`MarkerKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerValue {
    Counter(u64),
    Absolute(Option<String>),
    Accumulate {
        values: Vec<String>,
        /// Unix-epoch seconds, parallel to `values` when timestamps are on
        timestamps: Vec<i64>,
    },
}

impl MarkerValue {
    fn empty(kind: MarkerKind) -> Self {
        match kind {
            MarkerKind::Counter => MarkerValue::Counter(0),
            MarkerKind::Absolute => MarkerValue::Absolute(None),
            MarkerKind::Accumulate => MarkerValue::Accumulate {
                values: Vec::new(),
                timestamps: Vec::new(),
            },
        }
    }

    pub fn kind(&self) -> MarkerKind {
        match self {
            MarkerValue::Counter(_) => MarkerKind::Counter,
            MarkerValue::Absolute(_) => MarkerKind::Absolute,
            MarkerValue::Accumulate { .. } => MarkerKind::Accumulate,
        }
    }
}

// ----------------------------------------------------------------------------
// Event Marker
// ----------------------------------------------------------------------------

/// A counter or value slot fed by component events
#[derive(Debug, Clone)]
pub struct EventMarker {
    /// Event name the component emits
    pub name: String,
    /// Component that emits the event
    pub component: String,
    /// Name used in the report instead of `name`
    pub alias: Option<String>,
    /// Report the marker even when it holds nothing
    pub report_empty: bool,
    /// Record an epoch timestamp per accumulated value
    pub report_timestamps: bool,
    /// Occurrences the component may skip between emissions
    pub skip_frequency: u32,
    value: MarkerValue,
}

impl EventMarker {
    pub fn new(name: impl Into<String>, component: impl Into<String>, kind: MarkerKind) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            alias: None,
            report_empty: false,
            report_timestamps: false,
            skip_frequency: 0,
            value: MarkerValue::empty(kind),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_report_empty(mut self, report_empty: bool) -> Self {
        self.report_empty = report_empty;
        self
    }

    pub fn with_timestamps(mut self, report_timestamps: bool) -> Self {
        self.report_timestamps = report_timestamps;
        self
    }

    pub fn with_skip_frequency(mut self, skip_frequency: u32) -> Self {
        self.skip_frequency = skip_frequency;
        self
    }

    pub fn kind(&self) -> MarkerKind {
        self.value.kind()
    }

    pub fn value(&self) -> &MarkerValue {
        &self.value
    }

    /// Name the marker is reported under
    pub fn report_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Apply one event occurrence.
    ///
    /// ACCUMULATE markers reject the value once `max_accumulate` entries are
    /// held; the stored list never grows past the cap.
    pub fn store(&mut self, value: &str, max_accumulate: usize) -> ProfileResult<()> {
        match &mut self.value {
            MarkerValue::Counter(count) => {
                *count = count.saturating_add(1);
            }
            MarkerValue::Absolute(slot) => {
                *slot = Some(value.to_string());
            }
            MarkerValue::Accumulate { values, timestamps } => {
                if values.len() >= max_accumulate {
                    return Err(ProfileError::AccumulationLimit {
                        marker: self.name.clone(),
                    });
                }
                values.push(value.to_string());
                if self.report_timestamps {
                    timestamps.push(chrono::Utc::now().timestamp());
                }
            }
        }
        Ok(())
    }

    /// Encode the marker into report entries and reset it.
    ///
    /// Counters are reported when non-zero, absolute values when set and
    /// accumulated values as an array (plus a `<name>_CT` timestamp array).
    /// Empty markers only appear when `report_empty` is set.
    pub fn take_report_entries(&mut self) -> Vec<(String, Value)> {
        let name = self.report_name().to_string();
        let mut entries = Vec::new();

        match &mut self.value {
            MarkerValue::Counter(count) => {
                if *count > 0 {
                    entries.push((name, Value::String(count.to_string())));
                    *count = 0;
                } else if self.report_empty {
                    entries.push((name, Value::String("0".into())));
                }
            }
            MarkerValue::Absolute(slot) => match slot.take() {
                Some(value) => entries.push((name, Value::String(value))),
                None if self.report_empty => entries.push((name, Value::String(String::new()))),
                None => {}
            },
            MarkerValue::Accumulate { values, timestamps } => {
                if !values.is_empty() || self.report_empty {
                    let drained: Vec<Value> = values.drain(..).map(Value::String).collect();
                    entries.push((name.clone(), Value::Array(drained)));

                    if self.report_timestamps {
                        let stamps: Vec<Value> = timestamps
                            .drain(..)
                            .map(|ts| Value::String(ts.to_string()))
                            .collect();
                        entries.push((format!("{}_CT", name), Value::Array(stamps)));
                    }
                }
                timestamps.clear();
            }
        }

        entries
    }
}

// ----------------------------------------------------------------------------
// Grep Marker
// ----------------------------------------------------------------------------

/// A value derived by scanning a log file for a pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMarker {
    /// Name the result is reported under
    pub name: String,
    /// Literal text searched for in each line
    pub search_string: String,
    /// Log file, relative to the scanner's log directory
    pub log_file: String,
    #[serde(default)]
    pub kind: MarkerKind,
    #[serde(default)]
    pub report_empty: bool,
    #[serde(default)]
    pub skip_frequency: u32,
}

impl GrepMarker {
    pub fn new(
        name: impl Into<String>,
        search_string: impl Into<String>,
        log_file: impl Into<String>,
        kind: MarkerKind,
    ) -> Self {
        Self {
            name: name.into(),
            search_string: search_string.into(),
            log_file: log_file.into(),
            kind,
            report_empty: false,
            skip_frequency: 0,
        }
    }
}
