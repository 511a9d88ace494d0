//! Coordinator metrics
//!
//! Prometheus-compatible counters and gauges for resharding operations:
//! - Operations started / finished by outcome
//! - Phase transitions and durable write retries
//! - Routing refresh notifications

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Counter for tracking event counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub operations_started: Counter,
    pub operations_succeeded: Counter,
    pub operations_failed: Counter,
    pub operations_in_flight: Gauge,

    pub write_retries: Counter,
    pub participant_updates: Counter,
    pub refresh_sent: Counter,
    pub refresh_failed: Counter,

    /// Transitions keyed by target phase name
    transitions: Mutex<BTreeMap<&'static str, u64>>,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            operations_started: Counter::new(),
            operations_succeeded: Counter::new(),
            operations_failed: Counter::new(),
            operations_in_flight: Gauge::new(),
            write_retries: Counter::new(),
            participant_updates: Counter::new(),
            refresh_sent: Counter::new(),
            refresh_failed: Counter::new(),
            transitions: Mutex::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record_transition(&self, to: &'static str) {
        if let Ok(mut transitions) = self.transitions.lock() {
            *transitions.entry(to).or_insert(0) += 1;
        }
    }

    pub fn transitions_to(&self, to: &str) -> u64 {
        self.transitions
            .lock()
            .map(|t| t.get(to).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters: [(&str, &str, u64); 7] = [
            (
                "minishard_operations_started_total",
                "Resharding operations started",
                self.operations_started.get(),
            ),
            (
                "minishard_operations_succeeded_total",
                "Resharding operations that reached done",
                self.operations_succeeded.get(),
            ),
            (
                "minishard_operations_failed_total",
                "Resharding operations that reached error",
                self.operations_failed.get(),
            ),
            (
                "minishard_write_retries_total",
                "Durable catalog writes retried after a transient failure",
                self.write_retries.get(),
            ),
            (
                "minishard_participant_updates_total",
                "Participant state reports accepted",
                self.participant_updates.get(),
            ),
            (
                "minishard_refresh_sent_total",
                "Routing refresh notifications delivered",
                self.refresh_sent.get(),
            ),
            (
                "minishard_refresh_failed_total",
                "Routing refresh notifications that failed",
                self.refresh_failed.get(),
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out.push_str("# HELP minishard_operations_in_flight Operations hosted by this node\n");
        out.push_str("# TYPE minishard_operations_in_flight gauge\n");
        let _ = writeln!(
            out,
            "minishard_operations_in_flight {}",
            self.operations_in_flight.get()
        );

        out.push_str("# HELP minishard_phase_transitions_total Persisted phase transitions\n");
        out.push_str("# TYPE minishard_phase_transitions_total counter\n");
        if let Ok(transitions) = self.transitions.lock() {
            for (phase, count) in transitions.iter() {
                let _ = writeln!(
                    out,
                    "minishard_phase_transitions_total{{phase=\"{}\"}} {}",
                    phase, count
                );
            }
        }

        out.push_str("# HELP minishard_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE minishard_uptime_seconds gauge\n");
        let _ = writeln!(out, "minishard_uptime_seconds {}", self.uptime_seconds());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
