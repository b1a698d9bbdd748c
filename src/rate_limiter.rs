//! Cooperative token-bucket rate limiting for the model-calling stages.
//!
//! `original_source`'s Scorer and Writer services each wrap their model
//! calls in an `aiolimiter.AsyncLimiter(max_rate, time_period)` (see
//! `services/content_validator/ranker.py` and `services/writer/ai_writer.py`).
//! `AsyncLimiter` is itself a token bucket that refills continuously and
//! suspends the calling coroutine rather than the OS thread; this is a
//! direct hand-rolled translation of that behavior using `tokio::time`,
//! since spec.md §5/§9 forbids blocking the runtime's OS thread and no
//! example repo in the pack carries a rate-limiting crate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// A shared, cloneable token-bucket limiter: `max_rate` permits become
/// available per `1` second, continuously, rather than in discrete windows.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(max_rate_per_sec: u32) -> Self {
        let capacity = max_rate_per_sec.max(1) as f64;
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                refill_per_sec: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Wait until a single permit is available, consuming it. Never blocks
    /// the OS thread: every wait is a `tokio::time::sleep`.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                bucket.refill(now);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / bucket.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drains_then_refills_at_configured_rate() {
        let limiter = RateLimiter::new(2);

        // Two permits are available immediately.
        limiter.acquire().await;
        limiter.acquire().await;

        // The third must wait roughly half a second for one token to refill.
        let start = Instant::now();
        limiter.acquire().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(400));
    }
}
