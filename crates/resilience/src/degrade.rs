//! Graceful-degradation executor.
//!
//! Composes retry with exponential backoff, the per-operation circuit
//! breaker, a governing timeout, and a typed fallback into one call.  The
//! degrader switches on error values, never on panics; tools and providers
//! report failure through [`Error`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use exai_domain::error::{Error, Result, TimeoutLayer};

use crate::circuit::CircuitBreaker;

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Circuit-breaker key, e.g. `"glm_chat"` or the tool name.
    pub op_name: String,
    /// Governing deadline for each primary attempt and for the fallback.
    pub timeout: Duration,
    /// Additional attempts after the first (0 = single attempt).
    pub max_retries: u32,
}

impl ExecOptions {
    pub fn new(op_name: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            op_name: op_name.into(),
            timeout,
            max_retries,
        }
    }
}

/// The graceful-degradation executor.  One instance per daemon, sharing the
/// circuit breaker with health reporting.
pub struct Degrader {
    breaker: Arc<CircuitBreaker>,
}

impl Degrader {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// [`execute_with_fallback`](Self::execute_with_fallback) without a
    /// fallback path.
    pub async fn execute<T, P, PFut>(&self, opts: &ExecOptions, primary: P) -> Result<T>
    where
        P: Fn() -> PFut,
        PFut: Future<Output = Result<T>>,
    {
        self.execute_with_fallback(opts, primary, Option::<fn() -> PFut>::None)
            .await
    }

    /// Run `primary` with retry + circuit + timeout, falling back when the
    /// primary path is doomed.
    ///
    /// * Circuit open → fallback immediately, or [`Error::CircuitBreakerOpen`].
    /// * Each attempt runs under `opts.timeout`; failed attempts sleep
    ///   `2^attempt` seconds before the next.
    /// * An exhausted attempt chain records one failure, then the fallback
    ///   (if any) runs under the same timeout; otherwise the last primary
    ///   error propagates.
    ///
    /// `primary` is a factory: retries need a fresh future per attempt.
    pub async fn execute_with_fallback<T, P, PFut, F, FFut>(
        &self,
        opts: &ExecOptions,
        primary: P,
        fallback: Option<F>,
    ) -> Result<T>
    where
        P: Fn() -> PFut,
        PFut: Future<Output = Result<T>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T>>,
    {
        let op = opts.op_name.as_str();

        if self.breaker.is_open(op) {
            tracing::warn!(op, "circuit open, skipping primary");
            return match fallback {
                Some(fb) => {
                    let result = self.run_bounded(opts, fb()).await;
                    tracing::info!(op, ok = result.is_ok(), "fallback finished (circuit open)");
                    result
                }
                None => Err(Error::CircuitBreakerOpen {
                    op: op.to_owned(),
                    retry_after_s: self.breaker.seconds_until_close(op),
                }),
            };
        }

        let mut last_err = None;
        for attempt in 0..=opts.max_retries {
            match self.run_bounded(opts, primary()).await {
                Ok(value) => {
                    self.breaker.record_success(op);
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(
                        op,
                        attempt,
                        max_retries = opts.max_retries,
                        error = %err,
                        "primary attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < opts.max_retries {
                        tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                    }
                }
            }
        }

        self.breaker.record_failure(op);

        match fallback {
            Some(fb) => {
                tracing::info!(op, "primary exhausted, switching to fallback");
                self.run_bounded(opts, fb()).await
            }
            // last_err is always set: the loop ran at least once.
            None => Err(last_err.unwrap_or_else(|| Error::Internal("no attempt ran".into()))),
        }
    }

    async fn run_bounded<T>(
        &self,
        opts: &ExecOptions,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(opts.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                layer: TimeoutLayer::Tool,
                seconds: opts.timeout.as_secs(),
            }),
        }
    }
}
