//! Byte-rate throttle for background I/O.
//!
//! A token bucket refilled at `bytes_per_sec`. Compaction writers call
//! [`RateLimiter::acquire`] before writing each block; when the bucket is
//! empty the caller sleeps until enough tokens have accrued. The bucket
//! holds at most one second of budget, so an idle period never turns into
//! an unbounded burst.

use std::{
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter shared by all background writers.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A zero rate is treated as one byte per second.
    pub fn new(bytes_per_sec: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Take `bytes` tokens, blocking until they are available.
    ///
    /// Requests larger than the bucket are allowed to drive the balance
    /// negative; the debt is repaid by later callers waiting longer.
    pub fn acquire(&self, bytes: u64) {
        let wait = {
            let mut bucket = self.bucket.lock();
            self.refill(&mut bucket);
            bucket.tokens -= bytes as f64;
            if bucket.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.tokens / self.bytes_per_sec as f64)
        };

        trace!(bytes, wait_ms = wait.as_millis() as u64, "throttling background write");
        thread::sleep(wait);
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        let capacity = self.bytes_per_sec as f64;
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_budget_does_not_block() {
        let limiter = RateLimiter::new(1 << 20);
        let start = Instant::now();
        for _ in 0..8 {
            limiter.acquire(4096);
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn over_budget_sleeps() {
        let limiter = RateLimiter::new(10_000);
        limiter.acquire(10_000);
        let start = Instant::now();
        limiter.acquire(2_000);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn zero_rate_is_clamped() {
        assert_eq!(RateLimiter::new(0).bytes_per_sec(), 1);
    }
}
