//! Rate-limited progress heartbeat.
//!
//! Each in-flight operation owns one [`ProgressHeartbeat`].  The hosting
//! task calls [`send`](ProgressHeartbeat::send) as often as it likes; the
//! heartbeat emits at most once per interval, plus unconditional
//! [`force`](ProgressHeartbeat::force) emissions at operation boundaries.
//! Emission only happens inside an active [`HeartbeatGuard`] scope, which
//! disables the heartbeat on drop — on success, error, and cancellation
//! alike.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

/// Invoked with each emitted event.  Failures are contained: a panicking
/// callback is logged and the operation proceeds.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// A single progress emission.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Unix seconds.
    pub ts: f64,
    pub message: String,
    pub elapsed_secs: f64,
    /// `elapsed × (total − current) / current`, when both counters are set.
    pub estimated_remaining_secs: Option<f64>,
    pub step: Option<u32>,
    pub total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

struct HeartbeatState {
    enabled: bool,
    start: Instant,
    last_emit: Option<Instant>,
    current_step: u32,
    total_steps: u32,
}

/// Rate-limited progress emitter scoped to one operation.
pub struct ProgressHeartbeat {
    interval: Duration,
    callback: ProgressCallback,
    state: Mutex<HeartbeatState>,
}

impl ProgressHeartbeat {
    pub fn new(interval: Duration, callback: ProgressCallback) -> Arc<Self> {
        Arc::new(Self {
            interval,
            callback,
            state: Mutex::new(HeartbeatState {
                enabled: false,
                start: Instant::now(),
                last_emit: None,
                current_step: 0,
                total_steps: 0,
            }),
        })
    }

    /// Enter the emission scope: enables the heartbeat and stamps the start
    /// time.  Emission stops when the returned guard drops.
    pub fn activate(self: &Arc<Self>) -> HeartbeatGuard {
        let mut state = self.state.lock();
        state.enabled = true;
        state.start = Instant::now();
        state.last_emit = None;
        HeartbeatGuard { heartbeat: Arc::clone(self) }
    }

    /// Emit if at least one interval has elapsed since the last emission.
    /// Returns whether an event was emitted.
    pub fn send(&self, message: &str, metadata: Option<Value>) -> bool {
        self.emit(message, metadata, false)
    }

    /// Emit unconditionally (operation boundaries).
    pub fn force(&self, message: &str, metadata: Option<Value>) -> bool {
        self.emit(message, metadata, true)
    }

    pub fn set_total_steps(&self, total: u32) {
        self.state.lock().total_steps = total;
    }

    pub fn set_current_step(&self, step: u32) {
        self.state.lock().current_step = step;
    }

    pub fn current_step(&self) -> u32 {
        self.state.lock().current_step
    }

    pub fn total_steps(&self) -> u32 {
        self.state.lock().total_steps
    }

    fn emit(&self, message: &str, metadata: Option<Value>, force: bool) -> bool {
        let event = {
            let mut state = self.state.lock();
            if !state.enabled {
                return false;
            }
            let now = Instant::now();
            if !force {
                if let Some(last) = state.last_emit {
                    if now.duration_since(last) < self.interval {
                        return false;
                    }
                }
            }
            state.last_emit = Some(now);

            let elapsed = now.duration_since(state.start).as_secs_f64();
            ProgressEvent {
                ts: unix_now(),
                message: message.to_owned(),
                elapsed_secs: elapsed,
                estimated_remaining_secs: estimate_remaining(
                    elapsed,
                    state.current_step,
                    state.total_steps,
                ),
                step: (state.current_step > 0).then_some(state.current_step),
                total_steps: (state.total_steps > 0).then_some(state.total_steps),
                metadata,
            }
        };

        // Invoke outside the lock; contain callback panics.
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(&event)));
        if result.is_err() {
            tracing::warn!(message = %event.message, "progress callback panicked; continuing");
        }
        true
    }
}

fn estimate_remaining(elapsed: f64, current: u32, total: u32) -> Option<f64> {
    if total == 0 || current == 0 {
        return None;
    }
    Some(elapsed * (total.saturating_sub(current)) as f64 / current as f64)
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Scope guard returned by [`ProgressHeartbeat::activate`].  Dropping it
/// disables emission, on every exit path including unwind.
pub struct HeartbeatGuard {
    heartbeat: Arc<ProgressHeartbeat>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.heartbeat.state.lock().enabled = false;
    }
}

/// Active heartbeats keyed by request id, supporting concurrent operations.
#[derive(Default)]
pub struct ProgressTracker {
    active: Mutex<HashMap<String, Arc<ProgressHeartbeat>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str, heartbeat: Arc<ProgressHeartbeat>) {
        self.active.lock().insert(request_id.to_owned(), heartbeat);
    }

    pub fn remove(&self, request_id: &str) {
        self.active.lock().remove(request_id);
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<ProgressHeartbeat>> {
        self.active.lock().get(request_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (ProgressCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let cb: ProgressCallback = Arc::new(move |_ev| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_to_one_per_interval() {
        let (cb, count) = counting_callback();
        let hb = ProgressHeartbeat::new(Duration::from_secs(2), cb);
        let _guard = hb.activate();

        // Back-to-back sends at 1 s spacing over 10 s.
        for _ in 0..10 {
            hb.send("tick", None);
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let emitted = count.load(Ordering::SeqCst);
        assert!((4..=6).contains(&emitted), "emitted {emitted}");
    }

    #[tokio::test(start_paused = true)]
    async fn force_bypasses_the_rate_limit() {
        let (cb, count) = counting_callback();
        let hb = ProgressHeartbeat::new(Duration::from_secs(60), cb);
        let _guard = hb.activate();

        assert!(hb.send("first", None));
        assert!(!hb.send("suppressed", None));
        assert!(hb.force("boundary", None));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn estimated_remaining_from_step_counters() {
        let captured: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let cb: ProgressCallback = Arc::new(move |ev| sink.lock().push(ev.clone()));

        let hb = ProgressHeartbeat::new(Duration::from_secs(1), cb);
        let _guard = hb.activate();
        hb.set_total_steps(5);
        hb.set_current_step(2);

        tokio::time::advance(Duration::from_secs(10)).await;
        hb.force("step 2", None);

        let events = captured.lock();
        let ev = events.last().unwrap();
        assert_eq!(ev.step, Some(2));
        assert_eq!(ev.total_steps, Some(5));
        let remaining = ev.estimated_remaining_secs.unwrap();
        assert!((remaining - 15.0).abs() < 0.1, "remaining = {remaining}");
    }

    #[tokio::test(start_paused = true)]
    async fn unset_counters_yield_no_estimate() {
        let captured: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let cb: ProgressCallback = Arc::new(move |ev| sink.lock().push(ev.clone()));

        let hb = ProgressHeartbeat::new(Duration::from_secs(1), cb);
        let _guard = hb.activate();
        hb.force("no counters", None);

        let events = captured.lock();
        assert!(events[0].estimated_remaining_secs.is_none());
        assert!(events[0].step.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_emits_outside_the_scope() {
        let (cb, count) = counting_callback();
        let hb = ProgressHeartbeat::new(Duration::from_secs(1), cb);

        assert!(!hb.send("before", None));
        {
            let _guard = hb.activate();
            assert!(hb.force("inside", None));
        }
        assert!(!hb.force("after", None));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_is_contained() {
        let cb: ProgressCallback = Arc::new(|_ev| panic!("boom"));
        let hb = ProgressHeartbeat::new(Duration::from_secs(1), cb);
        let _guard = hb.activate();

        // Must not propagate the panic.
        assert!(hb.force("boom", None));
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_supports_concurrent_operations() {
        let (cb, _count) = counting_callback();
        let tracker = ProgressTracker::new();

        let a = ProgressHeartbeat::new(Duration::from_secs(1), cb.clone());
        let b = ProgressHeartbeat::new(Duration::from_secs(1), cb);
        tracker.register("r1", a);
        tracker.register("r2", b);
        assert_eq!(tracker.len(), 2);
        assert!(tracker.get("r1").is_some());

        tracker.remove("r1");
        assert!(tracker.get("r1").is_none());
        assert_eq!(tracker.len(), 1);
    }
}
