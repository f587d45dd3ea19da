// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A token bucket capping the combined throughput of every worker in a batch.
///
/// Cloning shares the bucket. A rate of 0 disables limiting entirely and
/// `take` returns without touching any lock.
#[derive(Clone, Default)]
pub struct SpeedLimiter {
    bucket: Option<Arc<Mutex<TokenBucket>>>,
}

struct TokenBucket {
    /// Burst size in bytes; equal to one second's worth of the rate.
    capacity: f64,
    /// May go negative: a chunk larger than the bucket is admitted and paid back by sleeping.
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl SpeedLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        if rate_bytes_per_sec == 0 {
            return Self::unlimited();
        }
        let rate = rate_bytes_per_sec as f64;
        Self {
            bucket: Some(Arc::new(Mutex::new(TokenBucket {
                capacity: rate,
                tokens: rate,
                rate,
                last_refill: Instant::now(),
            }))),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Accounts for `amount` received bytes, sleeping off any deficit.
    pub async fn take(&self, amount: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        if amount == 0 {
            return;
        }

        let wait = {
            let mut bucket = bucket.lock().await;
            bucket.refill(Instant::now());
            bucket.tokens -= amount as f64;
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / bucket.rate)
            }
        };

        // The lock is already released here, so other workers keep accounting while we sleep.
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}
