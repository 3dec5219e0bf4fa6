//! Per-profile timers.
//!
//! Every registered profile gets its own thread waiting on a private
//! mutex/condvar pair. The scheduler knows profiles only by name and reports
//! back through a [`ScheduleListener`] it holds weakly, so the registry and
//! the scheduler never own each other.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

/// Receives timer notifications, keyed by profile name
pub trait ScheduleListener: Send + Sync {
    /// Recurring interval elapsed, or an interrupt arrived (`clear_seek_map`)
    fn on_interval(&self, profile: &str, clear_seek_map: bool);

    /// One-shot activation deadline elapsed
    fn on_activation_expired(&self, profile: &str);
}

/// Timer registration as seen by the registry
pub trait ProfileScheduler: Send + Sync + fmt::Debug {
    /// Start a timer; fails if `name` already has one.
    ///
    /// A zero `interval` never recurs and a zero `activation_timeout` never
    /// expires.
    fn register(
        &self,
        name: &str,
        interval: Duration,
        activation_timeout: Duration,
        repeat: bool,
    ) -> SchedulerResult<()>;

    /// Restart the deadlines of an existing timer of `name` from now
    fn reschedule(
        &self,
        name: &str,
        interval: Duration,
        activation_timeout: Duration,
        repeat: bool,
    ) -> SchedulerResult<()>;

    /// Stop and join the timer of `name`
    fn unregister(&self, name: &str) -> SchedulerResult<()>;

    /// Wake the timer of `name` and force a collection with seek-map reset
    fn interrupt(&self, name: &str) -> SchedulerResult<()>;

    fn is_registered(&self, name: &str) -> bool;

    fn registered_count(&self) -> usize;
}

// ----------------------------------------------------------------------------
// Timer State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timing {
    interval: Duration,
    activation_timeout: Duration,
    repeat: bool,
}

impl Timing {
    /// Next recurring tick and activation deadline, counted from `start`
    fn deadlines(&self, start: Instant) -> (Option<Instant>, Option<Instant>) {
        (
            (!self.interval.is_zero()).then(|| start + self.interval),
            (!self.activation_timeout.is_zero()).then(|| start + self.activation_timeout),
        )
    }
}

#[derive(Debug, Default)]
struct TimerState {
    terminated: bool,
    interrupted: bool,
    rescheduled: Option<Timing>,
}

#[derive(Debug, Default)]
struct TimerControl {
    state: Mutex<TimerState>,
    signal: Condvar,
}

/// Scheduler-side record of one profile
#[derive(Debug)]
struct TimerHandle {
    timing: Timing,
    control: Arc<TimerControl>,
    thread: Option<JoinHandle<()>>,
}

impl TimerHandle {
    fn stop(mut self, name: &str) {
        {
            let mut state = self.control.state.lock();
            state.terminated = true;
        }
        self.control.signal.notify_all();

        if let Some(thread) = self.thread.take() {
            // A listener may tear down its own timer; never join ourselves
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!(target: "telemetry::scheduler", profile = name, "Timer thread panicked");
            }
        }
    }
}

struct TimerTask {
    name: String,
    timing: Timing,
    control: Arc<TimerControl>,
    listener: Weak<dyn ScheduleListener>,
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl TimerTask {
    /// Run a listener callback without holding the timer lock.
    ///
    /// Returns false once the listener is gone.
    fn notify<F>(&self, state: &mut MutexGuard<'_, TimerState>, f: F) -> bool
    where
        F: FnOnce(&dyn ScheduleListener),
    {
        let Some(listener) = self.listener.upgrade() else {
            return false;
        };
        MutexGuard::unlocked(state, || f(listener.as_ref()));
        true
    }

    fn run(self) {
        let mut timing = self.timing;
        let (mut next_tick, mut activation_deadline) = timing.deadlines(Instant::now());

        debug!(
            target: "telemetry::scheduler",
            profile = %self.name,
            interval_secs = timing.interval.as_secs(),
            activation_secs = timing.activation_timeout.as_secs(),
            "Timer started"
        );

        let control = Arc::clone(&self.control);
        let mut state = control.state.lock();

        loop {
            if state.terminated {
                break;
            }

            if let Some(updated) = state.rescheduled.take() {
                timing = updated;
                (next_tick, activation_deadline) = timing.deadlines(Instant::now());
                debug!(target: "telemetry::scheduler", profile = %self.name, "Timer rescheduled");
                continue;
            }

            if state.interrupted {
                state.interrupted = false;
                if let Some(tick) = next_tick.as_mut() {
                    *tick = Instant::now() + timing.interval;
                }
                let name = self.name.as_str();
                if !self.notify(&mut state, |l| l.on_interval(name, true)) {
                    break;
                }
                continue;
            }

            match earliest(next_tick, activation_deadline) {
                None => {
                    control.signal.wait(&mut state);
                    continue;
                }
                Some(deadline) => {
                    if !control.signal.wait_until(&mut state, deadline).timed_out() {
                        continue;
                    }
                }
            }

            if state.terminated || state.interrupted || state.rescheduled.is_some() {
                continue;
            }

            let now = Instant::now();
            let name = self.name.as_str();

            if activation_deadline.map_or(false, |d| now >= d) {
                activation_deadline = None;
                next_tick = None;
                info!(target: "telemetry::scheduler", profile = name, "Activation timeout expired");
                if !self.notify(&mut state, |l| l.on_activation_expired(name)) {
                    break;
                }
                continue;
            }

            if next_tick.map_or(false, |t| now >= t) {
                next_tick = timing.repeat.then(|| now + timing.interval);
                if !self.notify(&mut state, |l| l.on_interval(name, false)) {
                    break;
                }
            }
        }

        debug!(target: "telemetry::scheduler", profile = %self.name, "Timer stopped");
    }
}

// ----------------------------------------------------------------------------
// Timer Scheduler
// ----------------------------------------------------------------------------

/// Default [`ProfileScheduler`]: one OS thread per registered profile
pub struct TimerScheduler {
    timers: DashMap<String, TimerHandle>,
    listener: Weak<dyn ScheduleListener>,
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl TimerScheduler {
    pub fn new(listener: Weak<dyn ScheduleListener>) -> Self {
        Self {
            timers: DashMap::new(),
            listener,
        }
    }

    /// Interval and activation timeout of a registered profile
    pub fn timing(&self, name: &str) -> Option<(Duration, Duration)> {
        self.timers
            .get(name)
            .map(|t| (t.timing.interval, t.timing.activation_timeout))
    }
}

impl ProfileScheduler for TimerScheduler {
    fn register(
        &self,
        name: &str,
        interval: Duration,
        activation_timeout: Duration,
        repeat: bool,
    ) -> SchedulerResult<()> {
        match self.timers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(SchedulerError::AlreadyRegistered {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                let control = Arc::new(TimerControl::default());
                let timing = Timing {
                    interval,
                    activation_timeout,
                    repeat,
                };
                let task = TimerTask {
                    name: name.to_string(),
                    timing,
                    control: Arc::clone(&control),
                    listener: self.listener.clone(),
                };

                let thread = thread::Builder::new()
                    .name(format!("timer-{}", name))
                    .spawn(move || task.run())
                    .map_err(|e| SchedulerError::ThreadSpawnFailed {
                        name: name.to_string(),
                        message: e.to_string(),
                    })?;

                slot.insert(TimerHandle {
                    timing,
                    control,
                    thread: Some(thread),
                });

                info!(
                    target: "telemetry::scheduler",
                    profile = name,
                    interval_secs = interval.as_secs(),
                    "Profile registered"
                );
                Ok(())
            }
        }
    }

    fn reschedule(
        &self,
        name: &str,
        interval: Duration,
        activation_timeout: Duration,
        repeat: bool,
    ) -> SchedulerResult<()> {
        let timing = Timing {
            interval,
            activation_timeout,
            repeat,
        };
        let control = {
            let mut handle =
                self.timers
                    .get_mut(name)
                    .ok_or_else(|| SchedulerError::NotRegistered {
                        name: name.to_string(),
                    })?;
            handle.timing = timing;
            Arc::clone(&handle.control)
        };

        control.state.lock().rescheduled = Some(timing);
        control.signal.notify_all();
        info!(
            target: "telemetry::scheduler",
            profile = name,
            interval_secs = interval.as_secs(),
            "Profile rescheduled"
        );
        Ok(())
    }

    fn unregister(&self, name: &str) -> SchedulerResult<()> {
        let (_, handle) = self
            .timers
            .remove(name)
            .ok_or_else(|| SchedulerError::NotRegistered {
                name: name.to_string(),
            })?;

        handle.stop(name);
        info!(target: "telemetry::scheduler", profile = name, "Profile unregistered");
        Ok(())
    }

    fn interrupt(&self, name: &str) -> SchedulerResult<()> {
        let control = self
            .timers
            .get(name)
            .map(|t| Arc::clone(&t.control))
            .ok_or_else(|| SchedulerError::NotRegistered {
                name: name.to_string(),
            })?;

        control.state.lock().interrupted = true;
        control.signal.notify_all();
        debug!(target: "telemetry::scheduler", profile = name, "Timer interrupted");
        Ok(())
    }

    fn is_registered(&self, name: &str) -> bool {
        self.timers.contains_key(name)
    }

    fn registered_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        let names: Vec<String> = self.timers.iter().map(|t| t.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.timers.remove(&name) {
                handle.stop(&name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Fired {
        Interval(String, bool),
        Activation(String),
    }

    struct ChannelListener {
        tx: Sender<(Fired, Instant)>,
    }

    impl ScheduleListener for ChannelListener {
        fn on_interval(&self, profile: &str, clear_seek_map: bool) {
            let _ = self
                .tx
                .send((Fired::Interval(profile.into(), clear_seek_map), Instant::now()));
        }

        fn on_activation_expired(&self, profile: &str) {
            let _ = self
                .tx
                .send((Fired::Activation(profile.into()), Instant::now()));
        }
    }

    fn scheduler() -> (Arc<ChannelListener>, TimerScheduler, Receiver<(Fired, Instant)>) {
        let (tx, rx) = unbounded();
        let listener = Arc::new(ChannelListener { tx });
        let weak: Weak<dyn ScheduleListener> = Arc::downgrade(&listener) as Weak<dyn ScheduleListener>;
        (listener, TimerScheduler::new(weak), rx)
    }

    #[test]
    fn test_recurring_interval_fires_repeatedly() {
        let (_listener, scheduler, rx) = scheduler();
        scheduler
            .register("P", Duration::from_millis(40), Duration::ZERO, true)
            .unwrap();

        for _ in 0..3 {
            let (fired, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(fired, Fired::Interval("P".into(), false));
        }
        scheduler.unregister("P").unwrap();
    }

    #[test]
    fn test_activation_fires_before_interval() {
        let (_listener, scheduler, rx) = scheduler();
        let start = Instant::now();
        scheduler
            .register("P", Duration::from_millis(500), Duration::from_millis(200), true)
            .unwrap();

        let (fired, at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired, Fired::Activation("P".into()));
        assert!(at.duration_since(start) >= Duration::from_millis(200));
        assert!(at.duration_since(start) < Duration::from_millis(500));

        // Recurrence stops after activation expiry
        assert!(rx.recv_timeout(Duration::from_millis(700)).is_err());
        scheduler.unregister("P").unwrap();
    }

    #[test]
    fn test_zero_interval_waits_for_interrupt() {
        let (_listener, scheduler, rx) = scheduler();
        scheduler
            .register("P", Duration::ZERO, Duration::ZERO, true)
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        scheduler.interrupt("P").unwrap();
        let (fired, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired, Fired::Interval("P".into(), true));
        scheduler.unregister("P").unwrap();
    }

    #[test]
    fn test_non_repeating_fires_once() {
        let (_listener, scheduler, rx) = scheduler();
        scheduler
            .register("P", Duration::from_millis(30), Duration::ZERO, false)
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        scheduler.unregister("P").unwrap();
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (_listener, scheduler, _rx) = scheduler();
        scheduler
            .register("P", Duration::from_secs(60), Duration::ZERO, true)
            .unwrap();

        let err = scheduler
            .register("P", Duration::from_secs(60), Duration::ZERO, true)
            .unwrap_err();
        assert_eq!(err, SchedulerError::AlreadyRegistered { name: "P".into() });
        assert_eq!(scheduler.registered_count(), 1);
        assert_eq!(
            scheduler.timing("P"),
            Some((Duration::from_secs(60), Duration::ZERO))
        );
    }

    #[test]
    fn test_unregister_is_reported_when_absent() {
        let (_listener, scheduler, _rx) = scheduler();
        scheduler
            .register("P", Duration::from_secs(60), Duration::ZERO, true)
            .unwrap();

        scheduler.unregister("P").unwrap();
        assert!(!scheduler.is_registered("P"));
        assert_eq!(
            scheduler.unregister("P").unwrap_err(),
            SchedulerError::NotRegistered { name: "P".into() }
        );
        assert!(scheduler.interrupt("P").is_err());
    }

    #[test]
    fn test_dropped_listener_stops_timer() {
        let (listener, scheduler, rx) = scheduler();
        drop(listener);
        scheduler
            .register("P", Duration::from_millis(20), Duration::ZERO, true)
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        scheduler.unregister("P").unwrap();
    }

    #[test]
    fn test_reschedule_restarts_after_activation_expiry() {
        let (_listener, scheduler, rx) = scheduler();
        scheduler
            .register("P", Duration::from_millis(40), Duration::from_millis(10), true)
            .unwrap();

        let (fired, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired, Fired::Activation("P".into()));
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        scheduler
            .reschedule("P", Duration::from_millis(40), Duration::ZERO, true)
            .unwrap();
        for _ in 0..2 {
            let (fired, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(fired, Fired::Interval("P".into(), false));
        }
        assert_eq!(
            scheduler.timing("P"),
            Some((Duration::from_millis(40), Duration::ZERO))
        );
        scheduler.unregister("P").unwrap();
    }

    #[test]
    fn test_reschedule_unknown_timer() {
        let (_listener, scheduler, _rx) = scheduler();
        assert_eq!(
            scheduler
                .reschedule("P", Duration::from_secs(1), Duration::ZERO, true)
                .unwrap_err(),
            SchedulerError::NotRegistered { name: "P".into() }
        );
    }
}
