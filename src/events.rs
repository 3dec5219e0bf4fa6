//! Component event ingestion.
//!
//! Components report events as `marker=value` lines, optionally prefixed with
//! the emitting component (`component:marker=value`). The [`EventReceiver`]
//! keeps the marker routes armed by enabled profiles, queues incoming events
//! on a bounded channel and forwards them from one dispatch thread into an
//! [`EventSink`], normally the profile registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::error::ProfileResult;
use crate::sources::EventMarkerRegistrar;

/// Route target for events that name no component
const ANY_COMPONENT: &str = "*";

/// Receiver of routed marker events
pub trait EventSink: Send + Sync {
    fn store_marker_event(&self, profile: &str, event: &str, value: &str) -> ProfileResult<()>;
}

// ============================================================================
// Event
// ============================================================================

/// One event reported by a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub component: Option<String>,
    pub name: String,
    pub value: String,
}

impl Event {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            component: None,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn from_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Parse `[component:]marker=value`. Returns `None` for blank or
    /// malformed lines.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let (key, value) = line.split_once('=')?;
        let (component, name) = match key.split_once(':') {
            Some((component, name)) => (Some(component.trim()), name.trim()),
            None => (None, key.trim()),
        };
        if name.is_empty() {
            return None;
        }

        Some(Self {
            component: component.filter(|c| !c.is_empty()).map(str::to_string),
            name: name.to_string(),
            value: value.trim().to_string(),
        })
    }
}

// ============================================================================
// Routes
// ============================================================================

#[derive(Debug)]
struct Route {
    profile: String,
    component: String,
    skip_frequency: u32,
    seen: AtomicU64,
}

impl Route {
    fn matches(&self, component: Option<&str>) -> bool {
        match component {
            None => true,
            Some(c) => self.component == ANY_COMPONENT || self.component == c,
        }
    }

    /// Count the event; true when it should be forwarded
    fn admit(&self) -> bool {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed);
        seen % (u64::from(self.skip_frequency) + 1) == 0
    }
}

type RouteTable = DashMap<String, Vec<Arc<Route>>>;

// ============================================================================
// Event Receiver
// ============================================================================

/// Bounded event queue with a background dispatcher
pub struct EventReceiver {
    routes: Arc<RouteTable>,
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    sink: Arc<RwLock<Option<Weak<dyn EventSink>>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReceiver")
            .field("routes", &self.routes.len())
            .field("queued", &self.sender.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventReceiver {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            routes: Arc::new(DashMap::new()),
            sender,
            receiver,
            sink: Arc::new(RwLock::new(None)),
            stop_tx: Mutex::new(None),
            dispatcher: Mutex::new(None),
            running: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach the sink that receives routed events
    pub fn connect(&self, sink: Weak<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Queue an event. Returns false if the queue is full or closed.
    pub fn publish(&self, event: Event) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "telemetry::events", event = %event.name, "Event queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Profiles routed for `marker`
    pub fn routed_profiles(&self, marker: &str) -> Vec<String> {
        self.routes
            .get(marker)
            .map(|routes| routes.iter().map(|r| r.profile.clone()).collect())
            .unwrap_or_default()
    }

    /// Stop the dispatcher; queued events are drained first
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender wakes the dispatcher
        self.stop_tx.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            // The dispatcher may hold the last reference to us
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(target: "telemetry::events", "Event dispatcher panicked");
            }
        }
        info!(target: "telemetry::events", "Event dispatch stopped");
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EventMarkerRegistrar for EventReceiver {
    fn arm_event_marker(&self, marker: &str, component: &str, profile: &str, skip_frequency: u32) {
        let component = if component.is_empty() {
            ANY_COMPONENT
        } else {
            component
        };

        let mut routes = self.routes.entry(marker.to_string()).or_default();
        if let Some(existing) = routes.iter_mut().find(|r| r.profile == profile) {
            *existing = Arc::new(Route {
                profile: profile.to_string(),
                component: component.to_string(),
                skip_frequency,
                seen: AtomicU64::new(0),
            });
        } else {
            routes.push(Arc::new(Route {
                profile: profile.to_string(),
                component: component.to_string(),
                skip_frequency,
                seen: AtomicU64::new(0),
            }));
        }
        debug!(target: "telemetry::events", marker, component, profile, skip_frequency, "Event marker armed");
    }

    fn disarm_profile(&self, profile: &str) {
        self.routes.retain(|_, routes| {
            routes.retain(|r| r.profile != profile);
            !routes.is_empty()
        });
        debug!(target: "telemetry::events", profile, "Event markers disarmed");
    }

    fn start_dispatch(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let events = self.receiver.clone();
        let routes = Arc::clone(&self.routes);
        let sink = Arc::clone(&self.sink);

        let spawned = thread::Builder::new()
            .name("event-dispatch".to_string())
            .spawn(move || dispatch_loop(&events, &stop_rx, &routes, &sink));

        match spawned {
            Ok(handle) => {
                *self.stop_tx.lock() = Some(stop_tx);
                *self.dispatcher.lock() = Some(handle);
                info!(target: "telemetry::events", "Event dispatch started");
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!(target: "telemetry::events", error = %e, "Unable to spawn event dispatcher");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------------

fn dispatch_loop(
    events: &Receiver<Event>,
    stop: &Receiver<()>,
    routes: &RouteTable,
    sink: &RwLock<Option<Weak<dyn EventSink>>>,
) {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => dispatch(&event, routes, sink),
                Err(_) => break,
            },
            recv(stop) -> _ => {
                for event in events.try_iter() {
                    dispatch(&event, routes, sink);
                }
                break;
            }
        }
    }
}

fn dispatch(event: &Event, routes: &RouteTable, sink: &RwLock<Option<Weak<dyn EventSink>>>) {
    // Clone out of the map so no shard lock is held while the sink runs
    let targets: Vec<Arc<Route>> = match routes.get(&event.name) {
        Some(routes) => routes
            .iter()
            .filter(|r| r.matches(event.component.as_deref()))
            .cloned()
            .collect(),
        None => {
            trace!(target: "telemetry::events", event = %event.name, "No route for event");
            return;
        }
    };

    let Some(sink) = sink.read().as_ref().and_then(Weak::upgrade) else {
        warn!(target: "telemetry::events", event = %event.name, "No sink connected, dropping event");
        return;
    };

    for route in targets {
        if !route.admit() {
            trace!(target: "telemetry::events", profile = %route.profile, event = %event.name, "Event skipped");
            continue;
        }
        if let Err(e) = sink.store_marker_event(&route.profile, &event.name, &event.value) {
            debug!(
                target: "telemetry::events",
                profile = %route.profile,
                event = %event.name,
                error = %e,
                "Event not stored"
            );
        }
    }
}
