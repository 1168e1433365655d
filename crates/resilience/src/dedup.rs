//! Expert-validation deduplication cache.
//!
//! Expert validations are expensive LLM calls; identical work — same tool,
//! same request, same findings — must run at most once per process.  The
//! first caller for a key computes; concurrent callers for the same key wait
//! on a watch channel and share the cached result.  Entries are never
//! evicted for the lifetime of the process.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;

use exai_domain::error::{Error, Result};

/// Upper bound on how long a waiter blocks on another caller's computation.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

struct DedupState {
    cache: HashMap<String, Value>,
    /// Keys currently being computed.  Dropping a key's sender wakes every
    /// subscribed waiter.
    in_progress: HashMap<String, watch::Sender<()>>,
}

/// Process-wide single-flight cache for expert validations.
pub struct ExpertDedup {
    state: Mutex<DedupState>,
    wait_timeout: Duration,
}

impl Default for ExpertDedup {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpertDedup {
    pub fn new() -> Self {
        Self::with_wait_timeout(DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_wait_timeout(wait_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(DedupState {
                cache: HashMap::new(),
                in_progress: HashMap::new(),
            }),
            wait_timeout,
        }
    }

    /// Run `compute` for `(tool, request_id, findings)` unless an identical
    /// validation already ran or is running.
    ///
    /// Exactly one caller per key executes `compute`.  Whatever happens to
    /// that computation — success, error, cancellation — a result lands in
    /// the cache so waiters unblock: errors and aborts cache a
    /// skip-validation stub.  The computing caller sees the original error;
    /// waiters and later callers see the cached object.
    pub async fn validate<F, Fut>(
        &self,
        tool: &str,
        request_id: &str,
        findings: &Value,
        compute: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let key = cache_key(tool, request_id, findings);
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            let mut rx = {
                let mut state = self.state.lock();
                if let Some(hit) = state.cache.get(&key) {
                    tracing::debug!(key = %key, "expert validation cache hit");
                    return Ok(hit.clone());
                }
                match state.in_progress.get(&key) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, _rx) = watch::channel(());
                        state.in_progress.insert(key.clone(), tx);
                        break;
                    }
                }
            };

            tracing::debug!(key = %key, "identical validation in flight, waiting");
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::DedupTimeout(key));
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                // Either the sender signalled or was dropped: re-check the cache.
                Ok(_) => continue,
                Err(_) => return Err(Error::DedupTimeout(key)),
            }
        }

        // This caller owns the computation.  The guard caches a stub on
        // abandonment (cancellation / unwind) so waiters always unblock.
        let mut guard = InFlightGuard { dedup: self, key: &key, done: false };
        let result = compute().await;

        let cached = match &result {
            Ok(value) => value.clone(),
            Err(err) => skip_validation_stub(&err.to_string()),
        };
        guard.finish(cached);
        result
    }

    /// Cached result for a key, if any (used by tests and health reporting).
    pub fn cached(&self, tool: &str, request_id: &str, findings: &Value) -> Option<Value> {
        let key = cache_key(tool, request_id, findings);
        self.state.lock().cache.get(&key).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn in_progress_len(&self) -> usize {
        self.state.lock().in_progress.len()
    }

    fn complete(&self, key: &str, value: Value) {
        let mut state = self.state.lock();
        state.cache.insert(key.to_owned(), value);
        // Dropping the sender wakes every waiter; they re-check the cache.
        state.in_progress.remove(key);
    }
}

struct InFlightGuard<'a> {
    dedup: &'a ExpertDedup,
    key: &'a str,
    done: bool,
}

impl InFlightGuard<'_> {
    fn finish(&mut self, value: Value) {
        self.dedup.complete(self.key, value);
        self.done = true;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(key = %self.key, "expert validation abandoned, caching stub");
            self.dedup
                .complete(self.key, skip_validation_stub("validation aborted"));
        }
    }
}

/// The degraded result cached when a validation cannot complete.
fn skip_validation_stub(reason: &str) -> Value {
    json!({
        "validated": false,
        "warning": "expert validation unavailable",
        "error": reason,
    })
}

/// `"{tool}:{request_id}:{sha256(canonical(findings))}"`.
///
/// The hash is taken over a canonical rendering with object keys in sorted
/// order at every depth, so it is independent of map iteration order.
pub fn cache_key(tool: &str, request_id: &str, findings: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(findings, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{tool}:{request_id}:{digest:x}")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn cache_key_ignores_key_order() {
        let a = json!({"severity": "high", "file": "main.rs", "nested": {"b": 2, "a": 1}});
        let b = json!({"nested": {"a": 1, "b": 2}, "file": "main.rs", "severity": "high"});
        assert_eq!(cache_key("debug", "r1", &a), cache_key("debug", "r1", &b));
    }

    #[test]
    fn cache_key_distinguishes_content() {
        let a = json!({"finding": "bug in foo"});
        let b = json!({"finding": "bug in bar"});
        assert_ne!(cache_key("debug", "r1", &a), cache_key("debug", "r1", &b));
        assert_ne!(cache_key("debug", "r1", &a), cache_key("debug", "r2", &a));
        assert_ne!(cache_key("debug", "r1", &a), cache_key("analyze", "r1", &a));
    }

    /// Two concurrent callers for the same key share one computation.
    #[tokio::test(start_paused = true)]
    async fn single_flight_for_identical_work() {
        let dedup = Arc::new(ExpertDedup::new());
        let computed = Arc::new(AtomicU32::new(0));
        let findings = json!({"issue": "off-by-one"});

        let run = |dedup: Arc<ExpertDedup>, computed: Arc<AtomicU32>, findings: Value| async move {
            dedup
                .validate("debug", "req1", &findings, || async {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(json!({"x": 1}))
                })
                .await
                .unwrap()
        };

        let (a, b) = tokio::join!(
            run(dedup.clone(), computed.clone(), findings.clone()),
            run(dedup.clone(), computed.clone(), findings.clone()),
        );

        assert_eq!(a, json!({"x": 1}));
        assert_eq!(b, json!({"x": 1}));
        assert_eq!(computed.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_progress_len(), 0);
        assert_eq!(dedup.cache_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_compute_independently() {
        let dedup = ExpertDedup::new();
        let computed = Arc::new(AtomicU32::new(0));

        for rid in ["r1", "r2"] {
            let computed = computed.clone();
            dedup
                .validate("debug", rid, &json!({"f": 1}), || async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("ok"))
                })
                .await
                .unwrap();
        }
        assert_eq!(computed.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.cache_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_result_returned_without_recompute() {
        let dedup = ExpertDedup::new();
        let findings = json!({"f": "x"});

        dedup
            .validate("analyze", "r9", &findings, || async { Ok(json!({"v": 1})) })
            .await
            .unwrap();

        let again = dedup
            .validate("analyze", "r9", &findings, || async {
                panic!("must not recompute")
            })
            .await
            .unwrap();
        assert_eq!(again, json!({"v": 1}));
    }

    /// A failed computation caches the skip-validation stub so waiters and
    /// later callers unblock, while the computing caller sees the error.
    #[tokio::test(start_paused = true)]
    async fn failure_caches_stub_and_unblocks_waiters() {
        let dedup = Arc::new(ExpertDedup::new());
        let findings = json!({"f": "broken"});

        let d1 = dedup.clone();
        let f1 = findings.clone();
        let computing = tokio::spawn(async move {
            d1.validate("debug", "r1", &f1, || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(Error::Provider { provider: "glm".into(), message: "500".into() })
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let waited = dedup
            .validate("debug", "r1", &findings, || async {
                panic!("waiter must not compute")
            })
            .await
            .unwrap();

        assert_eq!(waited["validated"], json!(false));
        assert!(computing.await.unwrap().is_err());
        assert_eq!(dedup.in_progress_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_with_typed_error() {
        let dedup = Arc::new(ExpertDedup::with_wait_timeout(Duration::from_secs(1)));
        let findings = json!({"f": "slow"});

        let d1 = dedup.clone();
        let f1 = findings.clone();
        let _hung = tokio::spawn(async move {
            d1.validate("debug", "r1", &f1, || async {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(json!("never"))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = dedup
            .validate("debug", "r1", &findings, || async { Ok(json!("n/a")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DedupTimeout(_)));
    }
}
