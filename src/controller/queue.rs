//! Rate-limited work queue
//!
//! A key is never processed by two workers at once: a key re-added while it
//! is being processed is parked as dirty and queued again on `done`. Retries
//! are delayed by the larger of a per-key exponential backoff and a shared
//! token bucket.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-key backoff base
pub const BASE_DELAY: Duration = Duration::from_millis(100);

/// Per-key backoff cap
pub const MAX_DELAY: Duration = Duration::from_secs(600);

/// Token bucket refill rate
pub const QPS: f64 = 10.0;

/// Token bucket size
pub const BURST: f64 = 100.0;

/// Exponential per-key backoff combined with a token bucket
pub struct RateLimiter {
    failures: Mutex<HashMap<String, u32>>,
    bucket: Mutex<Bucket>,
    base: Duration,
    cap: Duration,
    qps: f64,
}

struct Bucket {
    tokens: f64,
    burst: f64,
    last: Instant,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY, QPS, BURST)
    }
}

impl RateLimiter {
    pub fn new(base: Duration, cap: Duration, qps: f64, burst: f64) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(Bucket {
                tokens: burst,
                burst,
                last: Instant::now(),
            }),
            base,
            cap,
            qps,
        }
    }

    /// Delay before `key` may be retried; counts one more failure
    pub fn when(&self, key: &str) -> Duration {
        let backoff = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.to_string()).or_insert(0);
            let exponent = (*count).min(32);
            *count += 1;
            self.base
                .checked_mul(2u32.saturating_pow(exponent))
                .map_or(self.cap, |d| d.min(self.cap))
        };
        backoff.max(self.reserve())
    }

    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(bucket.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Deduplicating work queue with rate-limited requeues
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    limiter: RateLimiter,
}

impl WorkQueue {
    pub fn new(limiter: RateLimiter) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            limiter,
        })
    }

    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.limiter.when(key);
        self.add_after(key, delay);
    }

    /// Stop tracking retries of `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key; `None` once shut down
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; queue it again when it was re-added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
