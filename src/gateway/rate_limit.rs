//! Process-wide token-bucket rate limiting for model calls.
//!
//! Three independent buckets per provider route: requests per minute, input
//! tokens per minute, output tokens per minute. A call acquires all three at
//! once using a best-estimate of its input size and its configured max
//! output tokens; actual usage is reconciled after the call returns. Buckets
//! refill continuously rather than in discrete 60s windows, so there is no
//! bursty boundary behavior.
//!
//! The route is the provider prefix of a model id ("anthropic" from
//! "anthropic/claude-3-5-sonnet"), so exhausting the primary's budget still
//! leaves a differently-routed fallback usable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::cancel::{CancelToken, Interrupt};

/// Per-minute ceilings plus the maximum time a caller is willing to wait for
/// bucket capacity before giving up.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u32,
    pub input_tokens_per_minute: u32,
    pub output_tokens_per_minute: u32,
    /// Wait budget per acquire. Exceeding it fails with
    /// [`AcquireError::Exhausted`], which triggers model fallback upstream.
    pub max_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            input_tokens_per_minute: 200_000,
            output_tokens_per_minute: 80_000,
            max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("rate limit wait budget exhausted (needed {needed:?}, budget {budget:?})")]
    Exhausted { needed: Duration, budget: Duration },
    #[error("interrupted while waiting for rate limit")]
    Interrupted(Interrupt),
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    available: f64,
    refill_per_sec: f64,
}

impl Bucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute as f64;
        Self {
            capacity,
            available: capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        self.available =
            (self.available + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
    }

    /// Time until `amount` is available, or zero if it already is.
    fn wait_for(&self, amount: f64) -> Duration {
        if self.available >= amount {
            return Duration::ZERO;
        }
        let deficit = amount - self.available;
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }

    fn take(&mut self, amount: f64) {
        self.available -= amount;
    }

    /// Apply the difference between estimated and actual usage. Overruns put
    /// the bucket into debt (bounded by capacity) that continuous refill
    /// pays down; underruns are credited back.
    fn reconcile(&mut self, estimated: f64, actual: f64) {
        self.available = (self.available + estimated - actual).clamp(-self.capacity, self.capacity);
    }
}

#[derive(Debug)]
struct BucketState {
    requests: Bucket,
    input: Bucket,
    output: Bucket,
    last_refill: Instant,
}

impl BucketState {
    fn new(policy: &RateLimitPolicy) -> Self {
        Self {
            requests: Bucket::new(policy.requests_per_minute),
            input: Bucket::new(policy.input_tokens_per_minute),
            output: Bucket::new(policy.output_tokens_per_minute),
            last_refill: Instant::now(),
        }
    }

    fn refill_now(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        self.requests.refill(elapsed);
        self.input.refill(elapsed);
        self.output.refill(elapsed);
    }
}

/// Process-wide rate limiter shared by all tasks.
#[derive(Debug)]
pub struct RateLimiter {
    routes: Mutex<HashMap<String, BucketState>>,
    policy: RateLimitPolicy,
}

/// Sleep granularity while waiting for capacity; keeps cancellation prompt.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Provider route of a model id: "anthropic" from "anthropic/claude-3-5-sonnet".
pub fn model_route(model_id: &str) -> &str {
    model_id.split('/').next().unwrap_or(model_id)
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Acquire one request slot plus the estimated input/output token amounts
    /// from all three of the route's buckets simultaneously. Returns the time
    /// spent waiting.
    ///
    /// Fails fast if the projected wait exceeds the policy's wait budget, or
    /// if the estimate can never fit a bucket at all.
    pub async fn acquire(
        &self,
        route: &str,
        estimated_input_tokens: u32,
        estimated_output_tokens: u32,
        cancel: &CancelToken,
    ) -> Result<Duration, AcquireError> {
        let started = Instant::now();
        loop {
            if let Some(reason) = cancel.interrupted() {
                return Err(AcquireError::Interrupted(reason));
            }

            let wait = {
                let mut routes = self.routes.lock().expect("rate limiter lock");
                let state = routes
                    .entry(route.to_string())
                    .or_insert_with(|| BucketState::new(&self.policy));
                state.refill_now();

                // An estimate larger than a bucket's capacity never fits.
                if estimated_input_tokens as f64 > state.input.capacity
                    || estimated_output_tokens as f64 > state.output.capacity
                {
                    return Err(AcquireError::Exhausted {
                        needed: Duration::MAX,
                        budget: self.policy.max_wait,
                    });
                }

                let wait = state
                    .requests
                    .wait_for(1.0)
                    .max(state.input.wait_for(estimated_input_tokens as f64))
                    .max(state.output.wait_for(estimated_output_tokens as f64));

                if wait.is_zero() {
                    state.requests.take(1.0);
                    state.input.take(estimated_input_tokens as f64);
                    state.output.take(estimated_output_tokens as f64);
                    let waited = started.elapsed();
                    if !waited.is_zero() {
                        debug!(route, waited_ms = waited.as_millis() as u64, "rate limit wait");
                    }
                    return Ok(waited);
                }
                wait
            };

            let projected = started.elapsed() + wait;
            if projected > self.policy.max_wait {
                return Err(AcquireError::Exhausted {
                    needed: projected,
                    budget: self.policy.max_wait,
                });
            }

            tokio::time::sleep(wait.min(WAIT_SLICE)).await;
        }
    }

    /// Reconcile estimated token usage against the provider-reported actuals.
    pub fn reconcile(
        &self,
        route: &str,
        estimated_input: u32,
        actual_input: u32,
        estimated_output: u32,
        actual_output: u32,
    ) {
        let mut routes = self.routes.lock().expect("rate limiter lock");
        let Some(state) = routes.get_mut(route) else {
            return;
        };
        state.refill_now();
        state
            .input
            .reconcile(estimated_input as f64, actual_input as f64);
        state
            .output
            .reconcile(estimated_output as f64, actual_output as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rpm: u32, max_wait_ms: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            requests_per_minute: rpm,
            input_tokens_per_minute: 10_000,
            output_tokens_per_minute: 10_000,
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::new(policy(1, 10));
        let cancel = CancelToken::new();
        let waited = limiter.acquire("openai", 100, 100, &cancel).await.unwrap();
        assert!(waited < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn second_acquire_exhausts_wait_budget() {
        let limiter = RateLimiter::new(policy(1, 10));
        let cancel = CancelToken::new();
        limiter.acquire("openai", 10, 10, &cancel).await.unwrap();
        // Bucket refills at 1/60 req/sec; the next slot is ~60s away.
        let err = limiter
            .acquire("openai", 10, 10, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn routes_are_independent() {
        let limiter = RateLimiter::new(policy(1, 10));
        let cancel = CancelToken::new();
        limiter.acquire("openai", 10, 10, &cancel).await.unwrap();
        // A different provider route still has a full bucket.
        limiter.acquire("anthropic", 10, 10, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_estimate_fails_immediately() {
        let limiter = RateLimiter::new(policy(10, 10));
        let cancel = CancelToken::new();
        let err = limiter
            .acquire("openai", 1_000_000, 0, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let limiter = RateLimiter::new(policy(1, 60_000));
        let cancel = CancelToken::new();
        limiter.acquire("openai", 10, 10, &cancel).await.unwrap();
        cancel.cancel();
        let err = limiter
            .acquire("openai", 10, 10, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AcquireError::Interrupted(Interrupt::Cancelled)
        ));
    }

    #[tokio::test]
    async fn reconcile_credits_unused_output() {
        let limiter = RateLimiter::new(policy(100, 10));
        let cancel = CancelToken::new();
        limiter.acquire("openai", 1_000, 9_000, &cancel).await.unwrap();
        // Actual output was far smaller than the reservation; after
        // reconciliation a second large acquire fits again.
        limiter.reconcile("openai", 1_000, 1_000, 9_000, 100);
        limiter.acquire("openai", 1_000, 8_000, &cancel).await.unwrap();
    }

    #[test]
    fn model_route_extracts_provider_prefix() {
        assert_eq!(model_route("anthropic/claude-3-5-sonnet"), "anthropic");
        assert_eq!(model_route("no-slash-model"), "no-slash-model");
    }
}
