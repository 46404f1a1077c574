use rand::Rng;
use std::time::{Duration, Instant};

/// Latest deadline handed out when `now + delay` overflows the clock
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + delay`, saturating instead of panicking on overflow
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Capped exponential backoff with proportional random jitter
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent.min(100);
        self
    }

    /// `min(base * 2^attempt, max)` plus up to `jitter_percent` of that
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_ms(attempt);
        let jitter_cap = capped.saturating_mul(self.jitter_percent) / 100;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }

    fn capped_ms(&self, attempt: u32) -> u64 {
        self.base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(32)))
            .min(self.max_ms)
    }
}
