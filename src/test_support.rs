//! Recording stubs for every collaborator, shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{DeliveryError, DeliveryResult, SchedulerError, SchedulerResult, StoreError};
use crate::marker::GrepMarker;
use crate::registry::Collaborators;
use crate::scheduler::ProfileScheduler;
use crate::sources::{
    EventMarkerRegistrar, InMemoryParameterSource, LogScanSource, ProfileStore, ReportTransport,
    StoredConfig,
};

// ----------------------------------------------------------------------------
// Log Scanner
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingLogScanner {
    results: Mutex<Vec<(String, String)>>,
    saved: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    last_clear_seek_map: Mutex<Option<bool>>,
}

impl RecordingLogScanner {
    pub fn set_results(&self, results: Vec<(String, String)>) {
        *self.results.lock() = results;
    }

    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn last_clear_seek_map(&self) -> Option<bool> {
        *self.last_clear_seek_map.lock()
    }
}

impl LogScanSource for RecordingLogScanner {
    fn grep_results(
        &self,
        _profile: &str,
        _markers: &[GrepMarker],
        clear_seek_map: bool,
    ) -> Vec<(String, String)> {
        *self.last_clear_seek_map.lock() = Some(clear_seek_map);
        self.results.lock().clone()
    }

    fn save_grep_config(&self, profile: &str, _markers: &[GrepMarker]) {
        self.saved.lock().push(profile.to_string());
    }

    fn remove_grep_config(&self, profile: &str) {
        self.removed.lock().push(profile.to_string());
    }
}

// ----------------------------------------------------------------------------
// Profile Store
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingStore {
    configs: Mutex<Vec<StoredConfig>>,
    clear_calls: AtomicUsize,
}

impl RecordingStore {
    pub fn set_configs(&self, configs: Vec<StoredConfig>) {
        *self.configs.lock() = configs;
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }
}

impl ProfileStore for RecordingStore {
    fn fetch_stored_configs(&self) -> Result<Vec<StoredConfig>, StoreError> {
        Ok(self.configs.lock().clone())
    }

    fn clear_persisted_state(&self) -> Result<(), StoreError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().clear();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub url: String,
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// Records delivery attempts; can fail, slow down or block them
#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    fail_next: AtomicUsize,
    delay: Mutex<Duration>,
    held: Mutex<bool>,
    released: Condvar,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingTransport {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Fail the next `n` attempts
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Block deliveries until [`release`](Self::release)
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    /// Attempts currently inside `deliver`
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ReportTransport for RecordingTransport {
    fn deliver(&self, url: &str, payload: &[u8], content_type: &str) -> DeliveryResult<()> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        {
            let mut held = self.held.lock();
            while *held {
                self.released.wait(&mut held);
            }
        }
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        self.deliveries.lock().push(Delivery {
            url: url.to_string(),
            payload: payload.to_vec(),
            content_type: content_type.to_string(),
        });

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.active.fetch_sub(1, Ordering::SeqCst);

        if failing {
            Err(DeliveryError::Status { status_code: 503 })
        } else {
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------------
// Event Registrar
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    armed: Mutex<Vec<(String, String, String)>>,
    disarmed: Mutex<Vec<String>>,
    started: AtomicBool,
}

impl RecordingRegistrar {
    /// `(marker, component, profile)` per arm call
    pub fn armed(&self) -> Vec<(String, String, String)> {
        self.armed.lock().clone()
    }

    pub fn disarmed(&self) -> Vec<String> {
        self.disarmed.lock().clone()
    }

    pub fn dispatch_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl EventMarkerRegistrar for RecordingRegistrar {
    fn arm_event_marker(&self, marker: &str, component: &str, profile: &str, _skip_frequency: u32) {
        self.armed
            .lock()
            .push((marker.to_string(), component.to_string(), profile.to_string()));
    }

    fn disarm_profile(&self, profile: &str) {
        self.disarmed.lock().push(profile.to_string());
    }

    fn start_dispatch(&self) {
        self.started.store(true, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Collaborator Bundle
// ----------------------------------------------------------------------------

/// Concrete stubs behind a [`Collaborators`] bundle
#[derive(Debug, Default)]
pub struct TestCollaborators {
    pub params: Arc<InMemoryParameterSource>,
    pub log_scan: Arc<RecordingLogScanner>,
    pub store: Arc<RecordingStore>,
    pub transport: Arc<RecordingTransport>,
    pub events: Arc<RecordingRegistrar>,
}

impl TestCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            params: self.params.clone(),
            log_scan: self.log_scan.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            events: self.events.clone(),
        }
    }
}

/// Default stubs with a specific transport
pub fn collaborators_with(transport: Arc<dyn ReportTransport>) -> Collaborators {
    Collaborators {
        transport,
        ..TestCollaborators::new().collaborators()
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Tracks registrations without running timers
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    registered: Mutex<HashSet<String>>,
    register_calls: AtomicUsize,
    reschedule_calls: AtomicUsize,
    fail: AtomicBool,
    interrupts: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    pub fn fail_registrations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn reschedule_calls(&self) -> usize {
        self.reschedule_calls.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> Vec<String> {
        self.interrupts.lock().clone()
    }
}

impl ProfileScheduler for RecordingScheduler {
    fn register(
        &self,
        name: &str,
        _interval: Duration,
        _activation_timeout: Duration,
        _repeat: bool,
    ) -> SchedulerResult<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SchedulerError::ThreadSpawnFailed {
                name: name.to_string(),
                message: "refused by test".into(),
            });
        }
        if !self.registered.lock().insert(name.to_string()) {
            return Err(SchedulerError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn reschedule(
        &self,
        name: &str,
        _interval: Duration,
        _activation_timeout: Duration,
        _repeat: bool,
    ) -> SchedulerResult<()> {
        if !self.registered.lock().contains(name) {
            return Err(SchedulerError::NotRegistered {
                name: name.to_string(),
            });
        }
        self.reschedule_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister(&self, name: &str) -> SchedulerResult<()> {
        if self.registered.lock().remove(name) {
            Ok(())
        } else {
            Err(SchedulerError::NotRegistered {
                name: name.to_string(),
            })
        }
    }

    fn interrupt(&self, name: &str) -> SchedulerResult<()> {
        if !self.registered.lock().contains(name) {
            return Err(SchedulerError::NotRegistered {
                name: name.to_string(),
            });
        }
        self.interrupts.lock().push(name.to_string());
        Ok(())
    }

    fn is_registered(&self, name: &str) -> bool {
        self.registered.lock().contains(name)
    }

    fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }
}
