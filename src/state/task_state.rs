/// Task state definitions for the crawl state machine
///
/// `Pending → InFlight → {Success, Retrying, Failed}`, with `Retrying`
/// returning to `Pending` once its backoff delay has elapsed. An `InFlight`
/// task released unattempted (run cancelled before its fetch) goes back to
/// `Pending`.
use std::fmt;

/// Represents the current state of a crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    // ===== Active States =====
    /// Waiting in the frontier for a worker
    Pending,

    /// Handed to a worker and not yet reported
    InFlight,

    /// Failed an attempt and waiting out its backoff delay
    Retrying,

    // ===== Terminal States =====
    /// Fetched, extracted and committed
    Success,

    /// Abandoned after a permanent error or exhausting its attempts
    Failed,
}

impl TaskState {
    /// Returns true if this is a terminal state (no further processing needed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Returns true if this state may still produce work
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Checks whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Success)
                | (Self::InFlight, Self::Retrying)
                | (Self::InFlight, Self::Failed)
                | (Self::InFlight, Self::Pending)
                | (Self::Retrying, Self::Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
