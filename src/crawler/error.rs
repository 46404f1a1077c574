use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Why a host asked us to slow down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffReason {
    /// HTTP 429
    RateLimited,
    /// robots.txt disallows the URL for our user agent
    RobotsDisallowed,
}

impl fmt::Display for BackoffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited (HTTP 429)"),
            Self::RobotsDisallowed => write!(f, "disallowed by robots.txt"),
        }
    }
}

/// Fetch failures, classified by how the scheduler should react
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, connection failure or HTTP 5xx; eligible for retry
    #[error("Transient fetch failure for {url}: {reason}")]
    Transient { url: String, reason: String },

    /// HTTP 4xx (other than 429) or an unusable URL; never retried
    #[error("Permanent fetch failure for {url}: {reason}")]
    Permanent { url: String, reason: String },

    /// The host wants us to wait; the task is delayed, not abandoned
    #[error("Backing off {url}: {reason}")]
    Backoff {
        url: String,
        reason: BackoffReason,
        retry_after: Option<Duration>,
    },

    /// The host's next slot is not open yet; nothing was sent
    #[error("Host for {url} is busy until its next slot")]
    HostBusy { url: String, until: Instant },

    /// The run was cancelled before the request went out
    #[error("Fetch of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Classifies a reqwest transport error
    pub fn from_reqwest(url: &str, e: &reqwest::Error) -> Self {
        if e.is_builder() {
            Self::permanent(url, format!("invalid request: {}", e))
        } else if e.is_redirect() {
            Self::permanent(url, format!("redirect error: {}", e))
        } else if e.is_timeout() {
            Self::transient(url, "request timed out")
        } else if e.is_connect() {
            Self::transient(url, format!("connection failed: {}", e))
        } else {
            Self::transient(url, e.to_string())
        }
    }
}
