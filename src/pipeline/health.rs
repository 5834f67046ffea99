//! Health counters for a controller

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Health metrics for a pipeline controller
///
/// All fields use atomic operations so a shell can read them from another
/// thread while the controller updates them.
pub struct PipelineHealth {
    /// Events delivered to handlers
    pub events_dispatched: AtomicU64,

    /// Events dropped because they came from a replaced graph or arrived while faulted
    pub events_discarded: AtomicU64,

    /// Warning-level runtime errors
    pub recoverable_errors: AtomicU64,

    /// Error-level runtime errors, each of which faulted the pipeline
    pub fatal_errors: AtomicU64,

    pub end_of_streams: AtomicU64,

    /// Successful requested transitions
    pub transitions: AtomicU64,

    /// Requested transitions that failed and were rolled back
    pub transition_failures: AtomicU64,

    pub builds: AtomicU64,
    pub build_failures: AtomicU64,
    pub device_switches: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last dispatched event
    pub last_event_time: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            events_dispatched: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            recoverable_errors: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            end_of_streams: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            transition_failures: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            device_switches: AtomicU64::new(0),
            last_event_time: AtomicU64::new(now_micros()),
        }
    }

    pub fn record_dispatch(&self) {
        self.last_event_time.store(now_micros(), Ordering::Relaxed);
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.events_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recoverable_error(&self) {
        self.recoverable_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_end_of_stream(&self) {
        self.end_of_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self, succeeded: bool) {
        if succeeded {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transition_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_build(&self, succeeded: bool) {
        if succeeded {
            self.builds.fetch_add(1, Ordering::Relaxed);
        } else {
            self.build_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_device_switch(&self) {
        self.device_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Check if no event has been dispatched for `threshold`
    pub fn is_quiet(&self, threshold: Duration) -> bool {
        let elapsed = now_micros().saturating_sub(self.last_event_time.load(Ordering::Relaxed));
        elapsed > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            end_of_streams: self.end_of_streams.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            transition_failures: self.transition_failures.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            device_switches: self.device_switches.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSummary {
    pub events_dispatched: u64,
    pub events_discarded: u64,
    pub recoverable_errors: u64,
    pub fatal_errors: u64,
    pub end_of_streams: u64,
    pub transitions: u64,
    pub transition_failures: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub device_switches: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} events ({} discarded), {} warnings, {} faults, {} eos, {} transitions ({} failed), {} builds ({} failed), {} device switches",
            self.events_dispatched,
            self.events_discarded,
            self.recoverable_errors,
            self.fatal_errors,
            self.end_of_streams,
            self.transitions,
            self.transition_failures,
            self.builds,
            self.build_failures,
            self.device_switches
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        health.record_build(true);
        health.record_transition(true);
        health.record_transition(true);
        health.record_transition(false);
        health.record_dispatch();
        health.record_fatal_error();

        let summary = health.summary();
        assert_eq!(summary.builds, 1);
        assert_eq!(summary.transitions, 2);
        assert_eq!(summary.transition_failures, 1);
        assert_eq!(summary.events_dispatched, 1);
        assert_eq!(summary.fatal_errors, 1);
        assert!(summary.to_string().contains("1 faults"));
    }

    #[test]
    fn test_quiet_detection() {
        let health = PipelineHealth::new();
        assert!(!health.is_quiet(Duration::from_secs(1)));

        health.record_dispatch();
        std::thread::sleep(Duration::from_millis(150));
        assert!(health.is_quiet(Duration::from_millis(100)));
    }
}
