//! Per-host robots.txt cache
//!
//! Fetched rules expire after a day so long crawls pick up changes to a
//! site's rules. When robots.txt could not be fetched at all the host is
//! treated as allowing everything, but only for a few minutes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::robots::ParsedRobots;

/// Lifetime of rules read from a robots.txt (or a 4xx meaning "no rules")
const RULES_TTL_HOURS: i64 = 24;

/// Lifetime of the allow-all stand-in used while robots.txt is unreachable
const UNREACHABLE_TTL_MINUTES: i64 = 5;

/// Robots rules for one host plus when they were fetched
#[derive(Debug, Clone)]
pub struct CachedRobots {
    pub rules: ParsedRobots,
    pub fetched_at: DateTime<Utc>,
    ttl: Duration,
}

impl CachedRobots {
    pub fn new(rules: ParsedRobots) -> Self {
        Self {
            rules,
            fetched_at: Utc::now(),
            ttl: Duration::hours(RULES_TTL_HOURS),
        }
    }

    fn unreachable() -> Self {
        Self {
            ttl: Duration::minutes(UNREACHABLE_TTL_MINUTES),
            ..Self::new(ParsedRobots::allow_all())
        }
    }

    pub fn is_stale(&self) -> bool {
        Utc::now() - self.fetched_at > self.ttl
    }
}

/// Shared table of robots rules keyed by host key
#[derive(Debug, Default)]
pub struct RobotsCache {
    entries: Mutex<HashMap<String, CachedRobots>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedRobots>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns fresh rules for `host`, or None when they must be (re)fetched
    pub fn get(&self, host: &str) -> Option<ParsedRobots> {
        self.entries()
            .get(host)
            .filter(|cached| !cached.is_stale())
            .map(|cached| cached.rules.clone())
    }

    pub fn insert(&self, host: &str, rules: ParsedRobots) {
        self.entries().insert(host.to_string(), CachedRobots::new(rules));
    }

    /// Allows everything on `host` until robots.txt can be fetched again
    pub fn insert_unreachable(&self, host: &str) {
        self.entries().insert(host.to_string(), CachedRobots::unreachable());
    }
}
