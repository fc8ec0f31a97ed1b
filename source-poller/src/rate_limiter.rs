//! Token bucket shared by every request to the upstream API, plus the cache of
//! the usage counters the API reports back.

use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::types::{rate_for, RateBudget, RatePolicy};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let new_tokens = elapsed * self.fill_rate;
        if new_tokens > 0.0 {
            self.tokens = (self.tokens + new_tokens).min(capacity);
        }
    }
}

/// Token bucket limiter.
///
/// Starts with a single token whatever the capacity, so a fresh process
/// cannot burst. The mutex is only held for arithmetic, never across a sleep.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    wait_timeout: Duration,
    period: Duration,
    safety_factor: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, fill_rate: f64, wait_timeout: Duration) -> Self {
        let policy = RatePolicy::default();
        Self {
            capacity: capacity.max(1),
            wait_timeout,
            period: policy.period,
            safety_factor: policy.safety_factor,
            state: Mutex::new(BucketState {
                tokens: 1.0,
                fill_rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket without burst capacity, filled at the policy's nominal rate.
    pub fn from_policy(policy: &RatePolicy, wait_timeout: Duration) -> Self {
        let mut bucket = Self::new(1, policy.nominal_rate(), wait_timeout);
        bucket.period = policy.period;
        bucket.safety_factor = policy.safety_factor;
        bucket
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The state is plain numbers; a panic mid-update cannot leave it
        // inconsistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take one token if available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        state.refill(self.capacity as f64);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping at most `wait_timeout` for it to refill.
    /// Retries exactly once after the sleep.
    pub async fn acquire_or_wait(&self) -> bool {
        if self.try_acquire() {
            return true;
        }

        let wait = {
            let state = self.lock();
            let needed = 1.0 - state.tokens;
            if state.fill_rate > 0.0 {
                Duration::try_from_secs_f64(needed / state.fill_rate)
                    .map_or(self.wait_timeout, |wait| wait.min(self.wait_timeout))
            } else {
                self.wait_timeout
            }
        };

        debug!("Waiting {:?} for a rate limit token", wait);
        tokio::time::sleep(wait).await;
        self.try_acquire()
    }

    /// Recompute the fill rate from the nominal allocation.
    ///
    /// `used` and `reset_secs` are accepted but not used: the upstream
    /// remaining counter is unreliable, so the rate is always derived from
    /// the full-period allocation.
    pub fn adjust_rate(&self, used: i64, reset_secs: i64, total_allowed: u32) {
        let _ = (used, reset_secs);
        let rate = rate_for(total_allowed, self.period, self.safety_factor);
        self.lock().fill_rate = rate;
    }

    pub fn fill_rate(&self) -> f64 {
        self.lock().fill_rate
    }

    /// Tokens currently in the bucket, without applying a refill.
    pub fn available_tokens(&self) -> f64 {
        self.lock().tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Last usage counters seen in response headers. Most recent write wins.
#[derive(Debug, Default)]
pub struct RateBudgetCache {
    inner: RwLock<RateBudget>,
}

impl RateBudgetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> RateBudget {
        *self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, budget: RateBudget) {
        *self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = budget;
    }
}
