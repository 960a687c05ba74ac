//! Deduplicating, rate-limited delay queue of reconcile keys
//!
//! The queue is the scheduling core of the controller. It turns a bursty
//! stream of `add` calls into an orderly sequence of passes with two
//! guarantees:
//!
//! - a key is held by at most one worker at a time. Adding a key that is
//!   in flight marks it dirty; it is re-queued once, when the current pass
//!   calls [`WorkQueue::done`].
//! - a key sits in the ready list at most once, however many times it is
//!   added before a worker picks it up.
//!
//! Delayed adds (`add_after`, `add_rate_limited`) park the key until its
//! ready-time; a key parked twice keeps the earlier ready-time.

mod rate_limiter;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::key::ReconcileKey;

pub use rate_limiter::{
    default_rate_limiter, ExponentialBackoff, MaxOf, RateLimitConfig, RateLimiter, TokenBucket,
};

#[derive(Default)]
struct QueueState {
    /// Keys ready for a worker, in FIFO order
    ready: VecDeque<ReconcileKey>,
    /// Keys that need a pass: everything in `ready` plus in-flight keys re-added
    dirty: HashSet<ReconcileKey>,
    /// Keys currently held by a worker
    processing: HashSet<ReconcileKey>,
    /// Earliest ready-time of each parked key
    waiting: HashMap<ReconcileKey, Instant>,
    /// Timer heap over `waiting`; entries not matching `waiting` are stale
    timers: BinaryHeap<Reverse<(Instant, u64, ReconcileKey)>>,
    seq: u64,
    shutting_down: bool,
}

impl QueueState {
    /// Mark `key` as needing a pass. Returns true if it became ready.
    fn insert(&mut self, key: ReconcileKey) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.waiting.remove(&key);
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    /// Move every parked key whose ready-time has passed into `ready`
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((at, _, _))) = self.timers.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, _, key))) = self.timers.pop() else {
                break;
            };
            if self.waiting.get(&key) == Some(&at) {
                self.waiting.remove(&key);
                self.insert(key);
            }
        }
    }

    /// Earliest live ready-time, discarding stale heap entries on the way
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, _, key))) = self.timers.peek() {
            if self.waiting.get(key) == Some(at) {
                return Some(*at);
            }
            self.timers.pop();
        }
        None
    }
}

/// Work queue shared by the event router (producer) and the workers (consumers)
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

impl WorkQueue {
    /// Create a queue using the given rate limiter for `add_rate_limited`
    pub fn new(limiter: impl RateLimiter + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Create a queue with the default exponential + token bucket limiter
    pub fn with_config(config: &RateLimitConfig) -> Self {
        Self::new(default_rate_limiter(config))
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule `key` for immediate processing
    ///
    /// No-op if the key is already ready. If a worker holds the key, the key
    /// is marked dirty and re-queued when that worker calls [`done`](Self::done).
    pub fn add(&self, key: ReconcileKey) {
        let became_ready = self.lock().insert(key);
        if became_ready {
            self.notify.notify_waiters();
        }
    }

    /// Schedule `key` for processing after `delay`
    pub fn add_after(&self, key: ReconcileKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay).unwrap_or_else(|| far_future(now));
        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            if matches!(state.waiting.get(&key), Some(at) if *at <= ready_at) {
                return;
            }
            state.seq += 1;
            let seq = state.seq;
            state.waiting.insert(key.clone(), ready_at);
            state.timers.push(Reverse((ready_at, seq, key)));
        }
        // sleeping workers recompute their deadline
        self.notify.notify_waiters();
    }

    /// Schedule `key` after the delay the rate limiter assigns it
    pub fn add_rate_limited(&self, key: ReconcileKey) {
        let delay = self.limiter.when(&key);
        trace!(key = %key, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Wait for the next ready key and mark it in flight
    ///
    /// Returns `None` once the queue is shut down and no ready keys remain.
    pub async fn get(&self) -> Option<ReconcileKey> {
        loop {
            // registered before inspecting state so no wakeup is lost
            let notified = self.notify.notified();
            let deadline = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release the in-flight mark on `key`, re-queueing it if it was re-added
    pub fn done(&self, key: &ReconcileKey) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Clear the backoff history of `key` after a successful pass
    pub fn forget(&self, key: &ReconcileKey) {
        self.limiter.forget(key);
    }

    /// Consecutive failed passes recorded for `key`
    pub fn num_requeues(&self, key: &ReconcileKey) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Stop accepting keys and wake every waiting worker
    ///
    /// Keys already ready are still handed out; parked keys are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.timers.clear();
        }
        self.notify.notify_waiters();
    }

    /// True once [`shut_down`](Self::shut_down) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready for a worker
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// True if no key is ready
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    /// Number of keys parked until a future ready-time
    pub fn parked(&self) -> usize {
        self.lock().waiting.len()
    }
}

/// Ready-time used when a delay does not fit in an `Instant`
fn far_future(now: Instant) -> Instant {
    // roughly 30 years, the same horizon tokio uses for its own far future
    now + Duration::from_secs(86400 * 365 * 30)
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::with_config(&RateLimitConfig::default())
    }
}
