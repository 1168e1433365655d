//! Per-operation circuit breaker.
//!
//! Each operation name accumulates consecutive failures; once the threshold
//! is reached the circuit is open and stays open for the recovery window.
//! There is no half-open probe: crossing the recovery window silently closes
//! the circuit and the next attempt goes through primary.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Thresholds, loaded once at startup.
#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit stays open.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl CircuitConfig {
    pub fn load_env() -> Self {
        Self::load_from(|name| std::env::var(name).ok())
    }

    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: lookup("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.failure_threshold),
            recovery_timeout: lookup("CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &u64| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_timeout),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CircuitEntry {
    failures: u32,
    last_failure: Instant,
}

/// Snapshot of one operation's circuit state (for the `health` op).
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub op: String,
    pub failures: u32,
    pub open: bool,
    pub seconds_until_close: Option<u64>,
}

/// Failure counters keyed by operation name, guarded by a single mutex.
pub struct CircuitBreaker {
    config: CircuitConfig,
    circuits: Mutex<HashMap<String, CircuitEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
    }

    /// Any success closes the circuit and zeroes the counter.
    pub fn record_success(&self, op: &str) {
        let mut circuits = self.circuits.lock();
        if circuits.remove(op).is_some() {
            tracing::debug!(op, "circuit reset after success");
        }
    }

    /// Count one fully-failed attempt chain.
    pub fn record_failure(&self, op: &str) {
        let mut circuits = self.circuits.lock();
        let entry = circuits.entry(op.to_owned()).or_insert(CircuitEntry {
            failures: 0,
            last_failure: Instant::now(),
        });
        entry.failures += 1;
        entry.last_failure = Instant::now();
        if entry.failures == self.config.failure_threshold {
            tracing::warn!(
                op,
                failures = entry.failures,
                recovery_s = self.config.recovery_timeout.as_secs(),
                "circuit opened"
            );
        }
    }

    /// Open iff the threshold is met and the recovery window has not elapsed.
    pub fn is_open(&self, op: &str) -> bool {
        let circuits = self.circuits.lock();
        match circuits.get(op) {
            Some(entry) => {
                entry.failures >= self.config.failure_threshold
                    && entry.last_failure.elapsed() < self.config.recovery_timeout
            }
            None => false,
        }
    }

    /// Seconds until an open circuit closes; `None` when closed.
    pub fn seconds_until_close(&self, op: &str) -> Option<u64> {
        let circuits = self.circuits.lock();
        let entry = circuits.get(op)?;
        if entry.failures < self.config.failure_threshold {
            return None;
        }
        let remaining = self
            .config
            .recovery_timeout
            .checked_sub(entry.last_failure.elapsed())?;
        Some(remaining.as_secs().max(1))
    }

    /// Per-operation snapshot for health reporting.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock();
        let mut snap: Vec<CircuitSnapshot> = circuits
            .iter()
            .map(|(op, entry)| {
                let open = entry.failures >= self.config.failure_threshold
                    && entry.last_failure.elapsed() < self.config.recovery_timeout;
                CircuitSnapshot {
                    op: op.clone(),
                    failures: entry.failures,
                    open,
                    seconds_until_close: open.then(|| {
                        self.config
                            .recovery_timeout
                            .saturating_sub(entry.last_failure.elapsed())
                            .as_secs()
                            .max(1)
                    }),
                }
            })
            .collect();
        snap.sort_by(|a, b| a.op.cmp(&b.op));
        snap
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
