//! Shared bandwidth limiter gating disk writes across all active segments.
//!
//! A single token bucket: capacity is `max(limit_bps, 4 KiB)` and tokens
//! refill continuously at `limit_bps` per second, computed on demand rather
//! than by a background tick. Writers request `n` tokens before committing a
//! network buffer to disk and suspend until the remaining deficit is covered.
//! With no limit configured the limiter is a pass-through.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Bucket capacity floor so tiny limits still admit a whole buffer.
const MIN_CAPACITY_BYTES: f64 = 4096.0;

/// Global token-bucket limiter. Clones share one bucket.
#[derive(Debug, Clone)]
pub struct BandwidthLimiter {
    /// Current limit in bytes/s; `<= 0` disables limiting.
    limit_bps: Arc<AtomicI64>,
    bucket: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

impl BandwidthLimiter {
    /// Creates a limiter; `None` (or a non-positive limit) disables it.
    #[must_use]
    pub fn new(limit_bps: Option<i64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        Self {
            limit_bps: Arc::new(AtomicI64::new(limit)),
            bucket: Arc::new(Mutex::new(Bucket {
                available: (limit as f64).max(MIN_CAPACITY_BYTES),
                last_refill: Instant::now(),
            })),
        }
    }

    /// Replaces the limit. Takes effect on the next acquisition; waiters
    /// already suspended finish at the old rate.
    pub fn set_limit(&self, limit_bps: Option<i64>) {
        let limit = limit_bps.unwrap_or(0);
        self.limit_bps.store(limit, Ordering::Relaxed);
        debug!(limit_bps = limit, "bandwidth limit updated");
    }

    /// Current limit; `None` when unlimited.
    #[must_use]
    pub fn limit(&self) -> Option<i64> {
        let limit = self.limit_bps.load(Ordering::Relaxed);
        (limit > 0).then_some(limit)
    }

    /// Acquires `bytes` tokens, suspending until the bucket covers them.
    ///
    /// The bucket lock is only held to account tokens; waiting happens
    /// outside it so writers never block each other while suspended.
    pub async fn acquire(&self, bytes: usize) {
        let mut need = bytes as f64;
        if need <= 0.0 {
            return;
        }

        loop {
            let limit = self.limit_bps.load(Ordering::Relaxed);
            if limit <= 0 {
                return;
            }
            let rate = limit as f64;
            let capacity = rate.max(MIN_CAPACITY_BYTES);

            let wait = {
                #[allow(clippy::unwrap_used)]
                let mut bucket = self.bucket.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(bucket.last_refill);
                bucket.available = (bucket.available + elapsed.as_secs_f64() * rate).min(capacity);
                bucket.last_refill = now;

                if bucket.available >= need {
                    bucket.available -= need;
                    return;
                }
                // Partial grant: drain what is there, wait out the deficit.
                need -= bucket.available;
                bucket.available = 0.0;
                Duration::from_secs_f64(need / rate)
            };

            tokio::time::sleep(wait).await;
        }
    }
}
