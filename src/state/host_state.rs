use std::time::{Duration, Instant};

use crate::crawler::deadline_after;

/// Tracks the pacing state of a single host
///
/// All workers share one table of these behind the rate limiter's lock.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    /// Number of requests granted to this host in the current run
    pub request_count: u32,

    /// Instant of the most recently granted request slot
    pub last_request_time: Option<Instant>,

    /// No request may be granted before this instant (429 / robots backoff)
    pub backoff_until: Option<Instant>,

    /// Extra spacing requested by the host's robots.txt `Crawl-delay`
    pub crawl_delay: Option<Duration>,
}

impl HostState {
    /// Effective spacing between requests: the larger of the configured
    /// delay and the host's crawl delay
    pub fn effective_delay(&self, configured: Duration) -> Duration {
        self.crawl_delay.map_or(configured, |d| d.max(configured))
    }

    /// Earliest instant at which the next request may start
    pub fn next_slot(&self, configured: Duration, now: Instant) -> Instant {
        let mut slot = now;

        if let Some(last) = self.last_request_time {
            slot = slot.max(deadline_after(last, self.effective_delay(configured)));
        }

        if let Some(until) = self.backoff_until {
            slot = slot.max(until);
        }

        slot
    }

    /// Records a granted request slot
    pub fn record_request(&mut self, at: Instant) {
        self.request_count += 1;
        self.last_request_time = Some(at);
    }

    /// Pushes the host's backoff deadline out to at least `until`
    pub fn back_off_until(&mut self, until: Instant) {
        self.backoff_until = Some(self.backoff_until.map_or(until, |current| current.max(until)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(1000);

    #[test]
    fn test_fresh_host_is_ready_now() {
        let state = HostState::default();
        let now = Instant::now();
        assert_eq!(state.next_slot(DELAY, now), now);
        assert_eq!(state.request_count, 0);
    }

    #[test]
    fn test_next_slot_spaced_after_last_request() {
        let mut state = HostState::default();
        let now = Instant::now();
        state.record_request(now);

        assert_eq!(state.next_slot(DELAY, now), now + DELAY);
        assert_eq!(
            state.next_slot(DELAY, now + Duration::from_millis(1100)),
            now + Duration::from_millis(1100)
        );
        assert_eq!(state.request_count, 1);
    }

    #[test]
    fn test_backoff_delays_next_slot() {
        let mut state = HostState::default();
        let now = Instant::now();
        state.back_off_until(now + Duration::from_secs(5));

        assert_eq!(state.next_slot(DELAY, now), now + Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_never_shrinks() {
        let mut state = HostState::default();
        let now = Instant::now();
        state.back_off_until(now + Duration::from_secs(5));
        state.back_off_until(now + Duration::from_secs(1));

        assert_eq!(state.backoff_until, Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_huge_crawl_delay_does_not_overflow() {
        let mut state = HostState::default();
        let now = Instant::now();
        state.crawl_delay = Some(Duration::MAX);
        state.record_request(now);

        assert!(state.next_slot(DELAY, now) > now);
    }

    #[test]
    fn test_crawl_delay_wins_when_larger() {
        let mut state = HostState::default();
        state.crawl_delay = Some(Duration::from_secs(5));
        assert_eq!(state.effective_delay(DELAY), Duration::from_secs(5));

        state.crawl_delay = Some(Duration::from_millis(500));
        assert_eq!(state.effective_delay(DELAY), DELAY);
    }
}
