//! Per-host request pacing
//!
//! The limiter owns the only host table shared between workers. It never
//! sleeps: a caller either claims the host's slot now or learns when the
//! next one opens, and the scheduler parks the task until then so the
//! worker can move on to another host.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::crawler::deadline_after;
use crate::state::HostState;

/// Shared per-host rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, HostState>> {
        match self.hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claims `host`'s slot if it is open at `now`
    ///
    /// Returns `Err(instant)` with the earliest instant the host will accept
    /// a request; nothing is reserved in that case.
    pub fn try_acquire(&self, host: &str, now: Instant) -> Result<(), Instant> {
        let mut hosts = self.hosts();
        let state = hosts.entry(host.to_string()).or_default();

        let slot = state.next_slot(self.delay, now);
        if slot > now {
            return Err(slot);
        }

        state.record_request(now);
        tracing::trace!(host, requests = state.request_count, "Granted host slot");
        Ok(())
    }

    /// Pushes `host`'s next slot out by at least `duration`
    pub fn back_off(&self, host: &str, duration: Duration) {
        let until = deadline_after(Instant::now(), duration);
        self.hosts()
            .entry(host.to_string())
            .or_default()
            .back_off_until(until);
        tracing::debug!(host, backoff_ms = duration.as_millis() as u64, "Host backing off");
    }

    /// Applies a robots.txt `Crawl-delay`
    pub fn set_crawl_delay(&self, host: &str, delay: Duration) {
        self.hosts().entry(host.to_string()).or_default().crawl_delay = Some(delay);
    }
}
