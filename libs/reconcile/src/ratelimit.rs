//! Retry pacing: per-item exponential backoff combined with an overall
//! token bucket. The larger of the two delays wins.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = 1u32
            .checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max));

        if self.jitter <= 0.0 {
            return delay;
        }

        let secs = delay.as_secs_f64();
        let range = secs * self.jitter.min(1.0);
        let jittered = secs + rand::rng().random_range(-range..=range);
        Duration::from_secs_f64(jittered.clamp(0.0, self.max.as_secs_f64()))
    }
}

/// Overall token bucket shared by every key of one engine.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    updated: Instant,
}

impl TokenBucket {
    /// `rate` tokens per second, holding at most `burst`.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                updated: Instant::now(),
            }),
        }
    }

    /// Take one token and return how long the caller must wait for it.
    ///
    /// Tokens may go negative; later callers queue behind earlier ones.
    pub fn reserve(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.updated).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.updated = now;

        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(10.0, 100)
    }
}

/// Retry delay calculator used by the engine.
#[derive(Debug)]
pub struct RateLimiter {
    backoff: BackoffPolicy,
    bucket: Option<TokenBucket>,
}

impl RateLimiter {
    pub fn new(backoff: BackoffPolicy, bucket: Option<TokenBucket>) -> Self {
        Self { backoff, bucket }
    }

    /// Per-item backoff only.
    pub fn backoff_only(backoff: BackoffPolicy) -> Self {
        Self::new(backoff, None)
    }

    /// Delay before retrying an item that has failed `attempt + 1` times.
    pub fn when(&self, attempt: u32) -> Duration {
        let item = self.backoff.delay(attempt);
        let overall = self
            .bucket
            .as_ref()
            .map(TokenBucket::reserve)
            .unwrap_or_default();
        item.max(overall)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), Some(TokenBucket::default()))
    }
}
