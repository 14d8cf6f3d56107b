use std::time::Duration;
use tokio::time::{self, Instant};

/// Token bucket: refills at `rate` tokens per second, holds at most `burst`.
pub(crate) struct RateLimiter {
    /// Time it takes to earn one token.
    period: Duration,
    burst: f64,
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    /// Starts full. A zero rate is treated as one token per second.
    pub fn new(rate: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));

        Self {
            period: Duration::from_secs(1) / rate.max(1),
            burst,
            tokens: burst,
            updated: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() / self.period.as_secs_f64()).min(self.burst);
        self.updated = now;
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }

            let missing = 1.0 - self.tokens;
            time::sleep(self.period.mul_f64(missing)).await;
        }
    }
}
