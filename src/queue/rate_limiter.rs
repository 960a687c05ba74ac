//! Requeue delay calculation
//!
//! The queue asks a [`RateLimiter`] how long a failed key should wait before
//! its next pass. The default limiter takes the larger of a per-key
//! exponential backoff and a global token bucket, so a single flapping key
//! backs off on its own while a failure storm across many keys is still
//! throttled as a whole.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::key::ReconcileKey;

/// Computes requeue delays for failing keys
pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed again; records one more failure
    fn when(&self, key: &ReconcileKey) -> Duration;

    /// Clear all failure history for `key`
    fn forget(&self, key: &ReconcileKey);

    /// Number of consecutive failures recorded for `key`
    fn num_requeues(&self, key: &ReconcileKey) -> u32;
}

/// Backoff and throttling parameters
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Delay after the first failure of a key
    pub base_delay: Duration,
    /// Upper bound for the per-key delay
    pub max_delay: Duration,
    /// Sustained global requeue rate (tokens per second)
    pub qps: f64,
    /// Token bucket size
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 50.0,
            burst: 300,
        }
    }
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ReconcileKey, u32>>,
}

impl ExponentialBackoff {
    /// Create a limiter with the given floor and ceiling
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        // overflow of 2^exp or of the product means we are past the ceiling
        1u32.checked_shl(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl RateLimiter for ExponentialBackoff {
    fn when(&self, key: &ReconcileKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        self.delay_for(exp)
    }

    fn forget(&self, key: &ReconcileKey) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }

    fn num_requeues(&self, key: &ReconcileKey) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Longest wait a [`TokenBucket`] hands out unless told otherwise
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1000);

/// Global token bucket shared by every key
///
/// Each call reserves one token; when the bucket is empty the returned delay
/// is the time until the reserved token is refilled, capped at `max_wait`.
/// A rate that is not a positive finite number disables throttling.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    max_wait: Duration,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            max_wait: DEFAULT_MAX_WAIT,
            state: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    /// Cap the delay returned for an empty bucket
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

impl RateLimiter for TokenBucket {
    fn when(&self, _key: &ReconcileKey) -> Duration {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Duration::ZERO;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // an overflowing wait is as good as the cap
            Duration::try_from_secs_f64(-state.tokens / self.qps)
                .map_or(self.max_wait, |wait| wait.min(self.max_wait))
        }
    }

    fn forget(&self, _key: &ReconcileKey) {}

    fn num_requeues(&self, _key: &ReconcileKey) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay any of them asks for
pub struct MaxOf {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOf {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOf {
    fn when(&self, key: &ReconcileKey) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &ReconcileKey) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &ReconcileKey) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// The controller's default limiter: exponential per key, token bucket overall
pub fn default_rate_limiter(config: &RateLimitConfig) -> MaxOf {
    MaxOf::new(vec![
        Box::new(ExponentialBackoff::new(config.base_delay, config.max_delay)),
        Box::new(TokenBucket::new(config.qps, config.burst).with_max_wait(config.max_delay)),
    ])
}
