//! Profile registry.
//!
//! The registry owns every profile behind one mutex. The lock covers list
//! mutation, lookups and the in-progress flag transition; it is never held
//! while a report is collected or delivered, and never while a timer thread
//! is joined.
//!
//! At most one report task runs per profile. A trigger that arrives while a
//! report is running is dropped, never queued.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::ReportCache;
use crate::config::GeneralConfig;
use crate::error::{
    ProfileError, ProfileResult, ReportResult, SchedulerError, TelemetryError, TelemetryResult,
};
use crate::events::EventSink;
use crate::marker::EventMarker;
use crate::profile::Profile;
use crate::report::{collect_and_report, InProgressGuard, ReportContext, ReportOutcome};
use crate::scheduler::{ProfileScheduler, ScheduleListener, TimerScheduler};
use crate::sources::{
    EventMarkerRegistrar, LogScanSource, ParameterSource, ProfileStore, ReportTransport,
};
use crate::stats::{ReportStats, StatsTracker};
use crate::{DEFAULT_MAX_REPORT_SIZE, MAX_ACCUMULATE, MAX_CACHED_REPORTS, MAX_PROFILES};

// ----------------------------------------------------------------------------
// Collaborators & Limits
// ----------------------------------------------------------------------------

/// External services the registry and report engine depend on
#[derive(Clone)]
pub struct Collaborators {
    pub params: Arc<dyn ParameterSource>,
    pub log_scan: Arc<dyn LogScanSource>,
    pub store: Arc<dyn ProfileStore>,
    pub transport: Arc<dyn ReportTransport>,
    pub events: Arc<dyn EventMarkerRegistrar>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Capacity limits applied by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_profiles: usize,
    pub max_cached_reports: usize,
    pub max_report_size: usize,
    pub max_accumulate: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_profiles: MAX_PROFILES,
            max_cached_reports: MAX_CACHED_REPORTS,
            max_report_size: DEFAULT_MAX_REPORT_SIZE,
            max_accumulate: MAX_ACCUMULATE,
        }
    }
}

impl From<&GeneralConfig> for RegistryLimits {
    fn from(config: &GeneralConfig) -> Self {
        Self {
            max_profiles: config.max_profiles,
            max_cached_reports: config.max_cached_reports,
            max_report_size: config.max_report_size,
            max_accumulate: config.max_accumulate,
        }
    }
}

// ----------------------------------------------------------------------------
// Profile Entry
// ----------------------------------------------------------------------------

type ReportTask = JoinHandle<ReportResult<ReportOutcome>>;

/// A profile plus its runtime state
struct ProfileEntry {
    profile: Profile,
    enabled: AtomicBool,
    /// Set under the registry lock when teardown starts
    deleting: AtomicBool,
    report_in_progress: AtomicBool,
    generate_now: AtomicBool,
    clear_seek_map: AtomicBool,
    event_markers: Mutex<Vec<EventMarker>>,
    cache: Mutex<ReportCache>,
    report_task: Mutex<Option<ReportTask>>,
    stats: StatsTracker,
}

impl ProfileEntry {
    fn new(mut profile: Profile, max_cached_reports: usize) -> Self {
        let markers = std::mem::take(&mut profile.event_markers);
        let generate_now = profile.generate_now;
        Self {
            profile,
            enabled: AtomicBool::new(false),
            deleting: AtomicBool::new(false),
            report_in_progress: AtomicBool::new(false),
            generate_now: AtomicBool::new(generate_now),
            clear_seek_map: AtomicBool::new(false),
            event_markers: Mutex::new(markers),
            cache: Mutex::new(ReportCache::new(max_cached_reports)),
            report_task: Mutex::new(None),
            stats: StatsTracker::new(),
        }
    }

    fn name(&self) -> &str {
        &self.profile.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Block until the current report task (if any) has finished
    fn join_report(&self) -> Option<ReportResult<ReportOutcome>> {
        let task = self.report_task.lock().take()?;
        match task.join() {
            Ok(result) => Some(result),
            Err(_) => {
                error!(target: "telemetry::registry", profile = self.name(), "Report task panicked");
                None
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Profile Registry
// ----------------------------------------------------------------------------

/// The authoritative set of reporting profiles
pub struct ProfileRegistry {
    profiles: Mutex<Vec<Arc<ProfileEntry>>>,
    scheduler: Arc<dyn ProfileScheduler>,
    collaborators: Collaborators,
    limits: RegistryLimits,
}

impl fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.count())
            .field("scheduler", &self.scheduler)
            .field("limits", &self.limits)
            .finish()
    }
}

impl ProfileRegistry {
    /// Build a registry around a scheduler that reports back to it by name
    pub fn new<F>(collaborators: Collaborators, limits: RegistryLimits, make_scheduler: F) -> Arc<Self>
    where
        F: FnOnce(Weak<dyn ScheduleListener>) -> Arc<dyn ProfileScheduler>,
    {
        Arc::new_cyclic(|registry: &Weak<Self>| {
            let listener: Weak<dyn ScheduleListener> = registry.clone();
            Self {
                profiles: Mutex::new(Vec::new()),
                scheduler: make_scheduler(listener),
                collaborators,
                limits,
            }
        })
    }

    /// Registry driven by the default thread-per-profile scheduler
    pub fn with_timer_scheduler(collaborators: Collaborators, limits: RegistryLimits) -> Arc<Self> {
        Self::new(collaborators, limits, |listener| {
            Arc::new(TimerScheduler::new(listener)) as Arc<dyn ProfileScheduler>
        })
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    pub fn scheduler(&self) -> &Arc<dyn ProfileScheduler> {
        &self.scheduler
    }

    fn find(&self, name: &str) -> Option<Arc<ProfileEntry>> {
        self.profiles
            .lock()
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    fn unregister_timer(&self, name: &str) {
        match self.scheduler.unregister(name) {
            Ok(()) => {}
            Err(SchedulerError::NotRegistered { .. }) => {
                debug!(target: "telemetry::registry", profile = name, "Profile already removed from scheduler");
            }
            Err(e) => warn!(target: "telemetry::registry", profile = name, error = %e, "Unregister failed"),
        }
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    /// Add a profile; it starts disabled
    pub fn add(&self, profile: Profile) -> ProfileResult<()> {
        let mut profiles = self.profiles.lock();

        if profiles.len() >= self.limits.max_profiles {
            error!(
                target: "telemetry::registry",
                max = self.limits.max_profiles,
                "Max profile count reached, can't add another profile"
            );
            return Err(ProfileError::CapacityExceeded {
                max: self.limits.max_profiles,
            });
        }
        if profiles.iter().any(|e| e.name() == profile.name) {
            return Err(ProfileError::AlreadyExists { name: profile.name });
        }

        let entry = Arc::new(ProfileEntry::new(profile, self.limits.max_cached_reports));
        if !entry.profile.grep_markers.is_empty() {
            self.collaborators
                .log_scan
                .save_grep_config(entry.name(), &entry.profile.grep_markers);
        }

        info!(target: "telemetry::registry", profile = entry.name(), "Profile added");
        profiles.push(entry);
        Ok(())
    }

    /// Enable a profile: arm its event markers and start its timer.
    ///
    /// Enabling an enabled profile is a no-op. Re-enabling a disabled one
    /// restarts its standing timer. A scheduler rejection rolls the enabled
    /// flag back.
    pub fn enable(&self, name: &str) -> TelemetryResult<()> {
        let generate_now = {
            let profiles = self.profiles.lock();
            let entry = profiles
                .iter()
                .find(|e| e.name() == name)
                .ok_or_else(|| ProfileError::not_found(name))?;

            if entry.deleting.load(Ordering::SeqCst) {
                debug!(target: "telemetry::registry", profile = name, "Profile is being deleted");
                return Err(ProfileError::not_found(name).into());
            }
            if entry.enabled.swap(true, Ordering::SeqCst) {
                debug!(target: "telemetry::registry", profile = name, "Profile already enabled");
                return Ok(());
            }

            for marker in entry.event_markers.lock().iter() {
                self.collaborators.events.arm_event_marker(
                    &marker.name,
                    &marker.component,
                    name,
                    marker.skip_frequency,
                );
            }

            // A disabled or expired profile keeps its timer; restart that one
            let profile = &entry.profile;
            let registered = match self.scheduler.register(
                name,
                profile.reporting_interval,
                profile.activation_timeout,
                true,
            ) {
                Err(SchedulerError::AlreadyRegistered { .. }) => self.scheduler.reschedule(
                    name,
                    profile.reporting_interval,
                    profile.activation_timeout,
                    true,
                ),
                other => other,
            };
            if let Err(e) = registered {
                entry.enabled.store(false, Ordering::SeqCst);
                error!(
                    target: "telemetry::registry",
                    profile = name,
                    error = %e,
                    "Unable to register profile with scheduler"
                );
                return Err(e.into());
            }

            entry.generate_now.load(Ordering::SeqCst)
        };

        self.collaborators.events.start_dispatch();
        info!(target: "telemetry::registry", profile = name, "Profile enabled");

        if generate_now {
            self.notify_timeout(name, false);
        }
        Ok(())
    }

    /// Clear the enabled flag.
    ///
    /// Returns `true` instead when a generate-now report is pending: the
    /// caller must defer deletion until it completes. The scheduler
    /// registration is left in place; [`delete`](Self::delete) removes it.
    pub fn disable(&self, name: &str) -> ProfileResult<bool> {
        let profiles = self.profiles.lock();
        let entry = profiles
            .iter()
            .find(|e| e.name() == name)
            .ok_or_else(|| ProfileError::not_found(name))?;

        if entry.generate_now.load(Ordering::SeqCst) {
            info!(
                target: "telemetry::registry",
                profile = name,
                "Generate-now pending, deletion deferred"
            );
            return Ok(true);
        }

        entry.enabled.store(false, Ordering::SeqCst);
        info!(target: "telemetry::registry", profile = name, "Profile disabled");
        Ok(false)
    }

    /// Disable, stop the timer, wait for any running report, then remove.
    ///
    /// The profile stays listed until it is gone, so its name cannot be
    /// re-added meanwhile; enable and triggers skip it.
    pub fn delete(&self, name: &str) -> ProfileResult<()> {
        let entry = {
            let profiles = self.profiles.lock();
            let entry = profiles
                .iter()
                .find(|e| e.name() == name)
                .ok_or_else(|| ProfileError::not_found(name))?;
            if entry.deleting.swap(true, Ordering::SeqCst) {
                debug!(target: "telemetry::registry", profile = name, "Profile already being deleted");
                return Err(ProfileError::not_found(name));
            }
            entry.enabled.store(false, Ordering::SeqCst);
            Arc::clone(entry)
        };
        self.unregister_timer(name);

        if entry.report_in_progress.load(Ordering::SeqCst) {
            info!(target: "telemetry::registry", profile = name, "Waiting for in-flight report");
        }
        entry.join_report();

        self.profiles.lock().retain(|e| !Arc::ptr_eq(e, &entry));
        self.collaborators.events.disarm_profile(name);
        if !entry.profile.grep_markers.is_empty() {
            self.collaborators.log_scan.remove_grep_config(name);
        }

        info!(target: "telemetry::registry", profile = name, "Profile deleted");
        Ok(())
    }

    /// Tear down every profile without touching persisted state
    fn teardown_all(&self) -> Vec<Arc<ProfileEntry>> {
        let entries: Vec<Arc<ProfileEntry>> = {
            let profiles = self.profiles.lock();
            profiles
                .iter()
                .filter(|e| !e.deleting.swap(true, Ordering::SeqCst))
                .inspect(|e| e.enabled.store(false, Ordering::SeqCst))
                .cloned()
                .collect()
        };

        for entry in &entries {
            self.unregister_timer(entry.name());
        }
        for entry in &entries {
            entry.join_report();
        }

        self.profiles
            .lock()
            .retain(|e| !entries.iter().any(|torn| Arc::ptr_eq(e, torn)));
        entries
    }

    /// Remove every profile and clear persisted profile state
    pub fn delete_all(&self) -> TelemetryResult<()> {
        let entries = self.teardown_all();

        for entry in &entries {
            self.collaborators.events.disarm_profile(entry.name());
            if !entry.profile.grep_markers.is_empty() {
                self.collaborators.log_scan.remove_grep_config(entry.name());
            }
        }
        info!(target: "telemetry::registry", count = entries.len(), "All profiles deleted");
        drop(entries);

        self.collaborators
            .store
            .clear_persisted_state()
            .map_err(TelemetryError::from)
    }

    /// Stop every timer and wait for running reports; persisted state stays
    pub fn shutdown(&self) {
        let entries = self.teardown_all();
        info!(target: "telemetry::registry", count = entries.len(), "Registry shut down");
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn count(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.find(name).map(|e| e.is_enabled())
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles
            .lock()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Name to content-hash mapping for change detection
    pub fn hash_map(&self) -> BTreeMap<String, String> {
        self.profiles
            .lock()
            .iter()
            .map(|e| (e.name().to_string(), e.profile.hash.clone()))
            .collect()
    }

    pub fn stats(&self, name: &str) -> Option<ReportStats> {
        self.find(name).map(|e| e.stats.snapshot())
    }

    pub fn cached_report_count(&self, name: &str) -> Option<usize> {
        self.find(name).map(|e| e.cache.lock().len())
    }

    pub fn is_report_in_progress(&self, name: &str) -> Option<bool> {
        self.find(name)
            .map(|e| e.report_in_progress.load(Ordering::SeqCst))
    }

    // ------------------------------------------------------------------------
    // Markers
    // ------------------------------------------------------------------------

    /// Apply one component event to the matching marker of an enabled profile
    pub fn store_marker_event(&self, name: &str, event: &str, value: &str) -> ProfileResult<()> {
        let entry = self.find(name).ok_or_else(|| {
            error!(target: "telemetry::registry", profile = name, "Profile not found");
            ProfileError::not_found(name)
        })?;

        if !entry.is_enabled() {
            warn!(target: "telemetry::registry", profile = name, event, "Profile is disabled, ignoring the event");
            return Err(ProfileError::Disabled {
                name: name.to_string(),
            });
        }

        let mut markers = entry.event_markers.lock();
        let marker = markers
            .iter_mut()
            .find(|m| m.name == event)
            .ok_or_else(|| {
                error!(target: "telemetry::registry", profile = name, event, value, "Event doesn't match any marker");
                ProfileError::UnknownMarker {
                    profile: name.to_string(),
                    event: event.to_string(),
                }
            })?;

        marker.store(value, self.limits.max_accumulate)?;
        debug!(target: "telemetry::registry", profile = name, event, kind = %marker.kind(), "Marker updated");
        Ok(())
    }

    /// Re-arm the event markers of every enabled profile
    pub fn rearm_event_markers(&self) {
        let enabled: Vec<Arc<ProfileEntry>> = self
            .profiles
            .lock()
            .iter()
            .filter(|e| e.is_enabled())
            .cloned()
            .collect();

        for entry in enabled {
            for marker in entry.event_markers.lock().iter() {
                self.collaborators.events.arm_event_marker(
                    &marker.name,
                    &marker.component,
                    entry.name(),
                    marker.skip_frequency,
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Report Triggers
    // ------------------------------------------------------------------------

    /// Start a report for `name` unless one is already running.
    ///
    /// Returns whether a report task was started.
    pub fn notify_timeout(&self, name: &str, clear_seek_map: bool) -> bool {
        let profiles = self.profiles.lock();
        let Some(entry) = profiles.iter().find(|e| e.name() == name) else {
            warn!(target: "telemetry::registry", profile = name, "Timeout for unknown profile");
            return false;
        };

        if !entry.is_enabled() || entry.deleting.load(Ordering::SeqCst) {
            debug!(target: "telemetry::registry", profile = name, "Profile disabled, ignoring timeout");
            return false;
        }
        if entry.report_in_progress.swap(true, Ordering::SeqCst) {
            entry.stats.record_dropped_trigger();
            warn!(
                target: "telemetry::registry",
                profile = name,
                "Report generation already in progress, ignoring the request"
            );
            return false;
        }
        entry.clear_seek_map.store(clear_seek_map, Ordering::SeqCst);

        let mut task = entry.report_task.lock();
        if let Some(previous) = task.take() {
            // Finished tasks are reaped, the rest are left to run out detached
            if previous.is_finished() && previous.join().is_err() {
                error!(target: "telemetry::registry", profile = name, "Previous report task panicked");
            }
        }

        let worker = Arc::clone(entry);
        let collaborators = self.collaborators.clone();
        let max_report_size = self.limits.max_report_size;

        let spawned = thread::Builder::new()
            .name(format!("report-{}", name))
            .spawn(move || {
                let _in_progress = InProgressGuard::new(&worker.report_in_progress);
                let clear_seek_map = worker.clear_seek_map.swap(false, Ordering::SeqCst);
                let ctx = ReportContext {
                    profile: &worker.profile,
                    event_markers: &worker.event_markers,
                    cache: &worker.cache,
                    stats: &worker.stats,
                    collaborators: &collaborators,
                    max_report_size,
                };
                let result = collect_and_report(&ctx, clear_seek_map);
                worker.generate_now.store(false, Ordering::SeqCst);
                result
            });

        match spawned {
            Ok(handle) => {
                *task = Some(handle);
                true
            }
            Err(e) => {
                entry.report_in_progress.store(false, Ordering::SeqCst);
                error!(target: "telemetry::registry", profile = name, error = %e, "Failed to spawn report task");
                false
            }
        }
    }

    /// Request an immediate report for an enabled profile
    pub fn generate_now(&self, name: &str) -> ProfileResult<()> {
        let entry = self.find(name).ok_or_else(|| ProfileError::not_found(name))?;
        if !entry.is_enabled() {
            return Err(ProfileError::Disabled {
                name: name.to_string(),
            });
        }

        entry.generate_now.store(true, Ordering::SeqCst);
        if !self.notify_timeout(name, false) {
            debug!(target: "telemetry::registry", profile = name, "Generate-now folded into running report");
        }
        Ok(())
    }

    /// Force collection with seek-map reset for every profile with grep markers
    pub fn send_log_upload_interrupt(&self) -> usize {
        let targets: Vec<String> = self
            .profiles
            .lock()
            .iter()
            .filter(|e| e.is_enabled() && !e.profile.grep_markers.is_empty())
            .map(|e| e.name().to_string())
            .collect();

        let mut interrupted = 0;
        for name in targets {
            match self.scheduler.interrupt(&name) {
                Ok(()) => interrupted += 1,
                Err(e) => warn!(target: "telemetry::registry", profile = %name, error = %e, "Interrupt failed"),
            }
        }
        info!(target: "telemetry::registry", interrupted, "Log upload interrupt sent");
        interrupted
    }

    /// Wait for the current report of `name` and return its result
    pub fn wait_for_report(&self, name: &str) -> Option<ReportResult<ReportOutcome>> {
        self.find(name)?.join_report()
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Add and enable every stored profile; returns how many were enabled.
    ///
    /// Unparseable or rejected configurations are logged and skipped.
    pub fn load_from_store(&self) -> usize {
        let configs = match self.collaborators.store.fetch_stored_configs() {
            Ok(configs) => configs,
            Err(e) => {
                warn!(target: "telemetry::registry", error = %e, "Unable to fetch stored profiles");
                return 0;
            }
        };

        let mut loaded = 0;
        for config in configs {
            let profile = match Profile::from_json(&config.raw) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(target: "telemetry::registry", file = %config.name, error = %e, "Skipping stored profile");
                    continue;
                }
            };
            let name = profile.name.clone();

            if let Err(e) = self.add(profile) {
                warn!(target: "telemetry::registry", profile = %name, error = %e, "Skipping stored profile");
                continue;
            }
            match self.enable(&name) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(target: "telemetry::registry", profile = %name, error = %e, "Stored profile not enabled"),
            }
        }

        info!(target: "telemetry::registry", loaded, "Stored profiles loaded");
        loaded
    }
}

// ----------------------------------------------------------------------------
// Callback Boundaries
// ----------------------------------------------------------------------------

impl ScheduleListener for ProfileRegistry {
    fn on_interval(&self, profile: &str, clear_seek_map: bool) {
        self.notify_timeout(profile, clear_seek_map);
    }

    fn on_activation_expired(&self, profile: &str) {
        if let Some(entry) = self.find(profile) {
            entry.enabled.store(false, Ordering::SeqCst);
            info!(target: "telemetry::registry", profile, "Activation timeout expired, profile disabled");
        }
    }
}

impl EventSink for ProfileRegistry {
    fn store_marker_event(&self, profile: &str, event: &str, value: &str) -> ProfileResult<()> {
        ProfileRegistry::store_marker_event(self, profile, event, value)
    }
}
