//! Report engine: one collection cycle of one profile.
//!
//! A cycle checks the encoding, builds the `{"Report": [...]}` document from
//! static parameters, data-model values, grep results and event markers (in
//! that order), encodes it and attempts one delivery. A successful delivery
//! flushes the retry cache; a failed one pushes the payload into it.
//!
//! The caller owns the in-progress flag; [`InProgressGuard`] clears it on
//! every exit path.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::cache::ReportCache;
use crate::error::{DeliveryError, ReportError, ReportResult};
use crate::logging::ReportTimer;
use crate::marker::EventMarker;
use crate::profile::{EncodingType, HttpDestination, JsonFormat, Param, Profile, Protocol};
use crate::registry::Collaborators;
use crate::sources::http::{JSON_CONTENT_TYPE, MSGPACK_CONTENT_TYPE};
use crate::stats::StatsTracker;
use crate::{REPORT_ARRAY_FIELD, SLOW_REPORT_THRESHOLD_MS};

// ----------------------------------------------------------------------------
// Outcome & Context
// ----------------------------------------------------------------------------

/// How a completed cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Delivered; `flushed` cached payloads followed, `remaining` stay cached
    Delivered {
        bytes: usize,
        flushed: usize,
        remaining: usize,
    },
    /// Delivery failed; the payload was cached
    Cached {
        bytes: usize,
        cached: usize,
        evicted: bool,
    },
}

/// Everything a cycle reads or mutates
#[derive(Debug)]
pub struct ReportContext<'a> {
    pub profile: &'a Profile,
    pub event_markers: &'a Mutex<Vec<EventMarker>>,
    pub cache: &'a Mutex<ReportCache>,
    pub stats: &'a StatsTracker,
    pub collaborators: &'a Collaborators,
    /// Advisory; larger payloads are logged and still sent
    pub max_report_size: usize,
}

/// Clears a report-in-progress flag when dropped
#[derive(Debug)]
pub struct InProgressGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InProgressGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Self {
        Self { flag }
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Collect And Report
// ----------------------------------------------------------------------------

/// Run one collection cycle.
///
/// Delivery failures are not errors: the payload is cached and the outcome is
/// [`ReportOutcome::Cached`]. Errors abort the cycle without caching.
pub fn collect_and_report(
    ctx: &ReportContext<'_>,
    clear_seek_map: bool,
) -> ReportResult<ReportOutcome> {
    let profile = ctx.profile;
    let timer = ReportTimer::start(profile.name.as_str(), SLOW_REPORT_THRESHOLD_MS);

    let result = run_cycle(ctx, clear_seek_map);

    let elapsed = timer.stop();
    ctx.stats.record_elapsed(elapsed);

    match &result {
        Ok(outcome) => info!(
            target: "telemetry::report",
            profile = %profile.name,
            elapsed_ms = elapsed.as_millis() as u64,
            outcome = ?outcome,
            "Report cycle complete"
        ),
        Err(e) => {
            ctx.stats.record_failure();
            error!(
                target: "telemetry::report",
                profile = %profile.name,
                error = %e,
                hint = ?e.recovery_hint(),
                "Report cycle aborted"
            );
        }
    }
    result
}

fn run_cycle(ctx: &ReportContext<'_>, clear_seek_map: bool) -> ReportResult<ReportOutcome> {
    let profile = ctx.profile;

    check_encoding(profile)?;

    let document = build_document(ctx, clear_seek_map);
    let payload = encode(profile, &document)?;
    drop(document);

    ctx.stats.record_generated(payload.len());
    info!(
        target: "telemetry::report",
        profile = %profile.name,
        size = payload.len(),
        "Report generated"
    );
    if payload.len() > ctx.max_report_size {
        warn!(
            target: "telemetry::report",
            profile = %profile.name,
            size = payload.len(),
            max = ctx.max_report_size,
            "Report size is exceeding the max limit"
        );
    }

    if profile.protocol != Protocol::Http {
        return Err(ReportError::UnsupportedProtocol {
            protocol: profile.protocol.to_string(),
        });
    }

    let destination = profile
        .http
        .as_ref()
        .ok_or_else(|| ReportError::MissingDestination {
            profile: profile.name.clone(),
        })?;
    let url = prepare_url(destination, ctx).map_err(|source| ReportError::Delivery {
        profile: profile.name.clone(),
        source,
    })?;

    Ok(deliver_or_cache(ctx, &url, payload))
}

fn check_encoding(profile: &Profile) -> ReportResult<()> {
    match &profile.encoding {
        EncodingType::Json | EncodingType::MessagePack => {}
        other => {
            return Err(ReportError::UnsupportedEncoding {
                encoding: other.to_string(),
            })
        }
    }
    if profile.json_format != JsonFormat::NameValuePair {
        return Err(ReportError::UnsupportedFormat {
            format: profile.json_format.to_string(),
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Document
// ----------------------------------------------------------------------------

fn entry(name: impl Into<String>, value: Value) -> Value {
    let mut object = Map::with_capacity(1);
    object.insert(name.into(), value);
    Value::Object(object)
}

/// Build the report document; drains event markers
pub fn build_document(ctx: &ReportContext<'_>, clear_seek_map: bool) -> Value {
    let profile = ctx.profile;
    let mut entries: Vec<Value> = Vec::new();

    for param in &profile.static_params {
        entries.push(entry(param.name.clone(), Value::String(param.value.clone())));
    }

    if !profile.params.is_empty() {
        let values = ctx.collaborators.params.get_values(&profile.params);
        for param in &profile.params {
            match values.get(&param.reference) {
                Some(value) if !value.is_empty() || param.report_empty => {
                    entries.push(entry(param.report_name(), Value::String(value.clone())));
                }
                None if param.report_empty => {
                    entries.push(entry(param.report_name(), Value::String(String::new())));
                }
                _ => debug!(
                    target: "telemetry::report",
                    profile = %profile.name,
                    param = %param.reference,
                    "Parameter has no value, skipped"
                ),
            }
        }
    }

    if !profile.grep_markers.is_empty() {
        let results = ctx.collaborators.log_scan.grep_results(
            &profile.name,
            &profile.grep_markers,
            clear_seek_map,
        );
        for (name, value) in results {
            entries.push(entry(name, Value::String(value)));
        }
    }

    {
        let mut markers = ctx.event_markers.lock();
        for marker in markers.iter_mut() {
            for (name, value) in marker.take_report_entries() {
                entries.push(entry(name, value));
            }
        }
    }

    entry(REPORT_ARRAY_FIELD, Value::Array(entries))
}

fn encode(profile: &Profile, document: &Value) -> ReportResult<Vec<u8>> {
    let encoded = match profile.encoding {
        EncodingType::MessagePack => rmp_serde::to_vec(document).map_err(|e| e.to_string()),
        _ => serde_json::to_vec(document).map_err(|e| e.to_string()),
    };
    encoded.map_err(|message| ReportError::Serialization {
        profile: profile.name.clone(),
        message,
    })
}

fn content_type(profile: &Profile) -> &'static str {
    match profile.encoding {
        EncodingType::MessagePack => MSGPACK_CONTENT_TYPE,
        _ => JSON_CONTENT_TYPE,
    }
}

// ----------------------------------------------------------------------------
// Delivery
// ----------------------------------------------------------------------------

/// Destination URL with request-URI parameters appended as query pairs
pub fn prepare_url(
    destination: &HttpDestination,
    ctx: &ReportContext<'_>,
) -> Result<String, DeliveryError> {
    let mut url = reqwest::Url::parse(&destination.url).map_err(|e| DeliveryError::InvalidUrl {
        url: destination.url.clone(),
        message: e.to_string(),
    })?;

    if destination.request_uri_params.is_empty() {
        return Ok(url.into());
    }

    let references: Vec<Param> = destination
        .request_uri_params
        .iter()
        .filter(|p| p.value.is_none())
        .filter_map(|p| p.reference.as_deref().map(Param::new))
        .collect();
    let resolved = if references.is_empty() {
        Default::default()
    } else {
        ctx.collaborators.params.get_values(&references)
    };

    {
        let mut query = url.query_pairs_mut();
        for param in &destination.request_uri_params {
            let value = param.value.as_deref().or_else(|| {
                param
                    .reference
                    .as_ref()
                    .and_then(|r| resolved.get(r))
                    .map(String::as_str)
            });
            match value {
                Some(value) => {
                    query.append_pair(&param.name, value);
                }
                None => warn!(
                    target: "telemetry::report",
                    profile = %ctx.profile.name,
                    param = %param.name,
                    "Request URI parameter has no value"
                ),
            }
        }
    }

    Ok(url.into())
}

fn deliver_or_cache(ctx: &ReportContext<'_>, url: &str, payload: Vec<u8>) -> ReportOutcome {
    let profile = ctx.profile;
    let transport = &ctx.collaborators.transport;
    let content_type = content_type(profile);
    let bytes = payload.len();

    match transport.deliver(url, &payload, content_type) {
        Err(e) => {
            let mut cache = ctx.cache.lock();
            if cache.len() >= cache.capacity() {
                debug!(
                    target: "telemetry::report",
                    profile = %profile.name,
                    "Max cached reports reached, overwriting third recent report"
                );
            }
            let evicted = cache.push_failed(payload).is_some();
            ctx.stats.record_cached(evicted);
            warn!(
                target: "telemetry::report",
                profile = %profile.name,
                error = %e,
                cached = cache.len(),
                "Delivery failed, report cached"
            );
            ReportOutcome::Cached {
                bytes,
                cached: cache.len(),
                evicted,
            }
        }
        Ok(()) => {
            ctx.stats.record_delivered();
            let mut cache = ctx.cache.lock();
            if cache.is_empty() {
                return ReportOutcome::Delivered {
                    bytes,
                    flushed: 0,
                    remaining: 0,
                };
            }

            info!(
                target: "telemetry::report",
                profile = %profile.name,
                cached = cache.len(),
                "Sending cached reports"
            );
            let summary = cache.flush(|cached| transport.deliver(url, cached, content_type));
            ctx.stats.record_flushed(summary.delivered);

            if let Some(e) = &summary.error {
                warn!(
                    target: "telemetry::report",
                    profile = %profile.name,
                    error = %e,
                    flushed = summary.delivered,
                    remaining = summary.remaining,
                    "Cached report flush stopped"
                );
            }
            ReportOutcome::Delivered {
                bytes,
                flushed: summary.delivered,
                remaining: summary.remaining,
            }
        }
    }
}
