//! The crawl frontier: per-task state machine, ordering and retry policy
//!
//! `Frontier` is plain data with no I/O or clocks of its own; every method
//! that depends on time takes `now`. The async `Scheduler` wraps it for the
//! worker pool.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::CrawlerConfig;
use crate::crawler::{deadline_after, ExponentialBackoff};
use crate::state::TaskState;
use crate::storage::FrontierEntry;
use crate::url::normalize_url;

/// A unit of crawl work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    /// Normalized URL; the task's identity in the frontier
    pub url: Url,
    pub mapping: String,
    pub depth: u32,
    /// Lower values are dispatched first
    pub priority: u32,
    pub attempt_count: u32,
    pub scheduled_at: Instant,
}

/// A request to add a URL to the frontier
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub url: Url,
    pub mapping: String,
    pub depth: u32,
    pub priority: u32,
    /// Attempts already spent (non-zero only when resuming a checkpoint)
    pub attempt_count: u32,
}

impl TaskRequest {
    pub fn new(url: Url, mapping: impl Into<String>, depth: u32, priority: u32) -> Self {
        Self {
            url,
            mapping: mapping.into(),
            depth,
            priority,
            attempt_count: 0,
        }
    }
}

/// Failure category recorded in a task's attempt history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    Backoff,
    Malformed,
    Storage,
}

impl FailureKind {
    /// Storage failures have already been retried by the pool, so they
    /// end the task like permanent ones
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Backoff)
    }
}

/// One failed attempt of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub kind: FailureKind,
    pub message: String,
}

/// What a worker reports back for a task
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success,
    Failed {
        kind: FailureKind,
        message: String,
        /// Minimum delay requested by the server
        retry_after: Option<Duration>,
    },
}

impl TaskOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }
}

/// The frontier's decision after a report
#[derive(Debug, Clone, PartialEq)]
pub enum Reported {
    Succeeded,
    Retrying { attempt: u32, delay: Duration },
    Failed { attempts: u32, history: Vec<AttemptRecord> },
    /// The task was not in flight (already reported or unknown)
    Ignored,
}

/// Result of asking the frontier for work
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    Ready(CrawlTask),
    /// Nothing dispatchable now; retry at the instant, or when notified
    Wait(Option<Instant>),
    /// No pending, retrying or in-flight tasks remain
    Exhausted,
}

/// Retry and re-crawl policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    pub re_crawl_interval: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: ExponentialBackoff::new(config.base_backoff_ms, config.max_backoff_ms)
                .with_jitter(config.jitter_percent),
            re_crawl_interval: Duration::from_secs(config.re_crawl_interval_secs),
        }
    }
}

/// Task counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontierCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct Entry {
    state: TaskState,
    task: CrawlTask,
    history: Vec<AttemptRecord>,
    /// Sequence number of the live heap item for this entry
    seq: u64,
    finished_at: Option<Instant>,
}

/// Ready-heap item: lower priority value first, then insertion order
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: u32,
    seq: u64,
    key: String,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so compare reversed
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed-heap item: earliest ready time first
#[derive(Debug, PartialEq, Eq)]
struct Delayed {
    ready_at: Instant,
    seq: u64,
    key: String,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// All tasks seen in this run, keyed by normalized URL
#[derive(Debug)]
pub struct Frontier {
    policy: RetryPolicy,
    entries: HashMap<String, Entry>,
    ready: BinaryHeap<Queued>,
    delayed: BinaryHeap<Delayed>,
    in_flight: usize,
    next_seq: u64,
}

impl Frontier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            ready: BinaryHeap::new(),
            delayed: BinaryHeap::new(),
            in_flight: 0,
            next_seq: 0,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Adds a URL unless its normalized form is already live
    ///
    /// Pending, in-flight and retrying URLs are always rejected. Succeeded
    /// and failed URLs are rejected until the re-crawl interval has passed
    /// since they finished, after which they start over as a fresh task.
    ///
    /// Returns true if the URL was enqueued.
    pub fn enqueue(&mut self, request: TaskRequest, now: Instant) -> bool {
        let url = match normalize_url(request.url.as_str()) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "Rejected unnormalizable URL");
                return false;
            }
        };
        let key = url.to_string();

        if let Some(existing) = self.entries.get(&key) {
            if existing.state.is_active() {
                return false;
            }
            let due = existing
                .finished_at
                .map_or(true, |at| now.saturating_duration_since(at) >= self.policy.re_crawl_interval);
            if !due {
                return false;
            }
        }

        let seq = self.bump_seq();
        self.ready.push(Queued {
            priority: request.priority,
            seq,
            key: key.clone(),
        });
        self.entries.insert(
            key,
            Entry {
                state: TaskState::Pending,
                task: CrawlTask {
                    url,
                    mapping: request.mapping,
                    depth: request.depth,
                    priority: request.priority,
                    attempt_count: request.attempt_count,
                    scheduled_at: now,
                },
                history: Vec::new(),
                seq,
                finished_at: None,
            },
        );
        true
    }

    /// Hands out the next dispatchable task, marking it in flight
    pub fn poll(&mut self, now: Instant) -> Poll {
        self.promote_due(now);

        while let Some(item) = self.ready.pop() {
            let Some(entry) = self.entries.get_mut(&item.key) else {
                continue;
            };
            if entry.seq != item.seq || !entry.state.can_transition_to(TaskState::InFlight) {
                continue;
            }

            entry.state = TaskState::InFlight;
            entry.task.scheduled_at = now;
            self.in_flight += 1;
            return Poll::Ready(entry.task.clone());
        }

        if let Some(next) = self.delayed.peek() {
            Poll::Wait(Some(next.ready_at))
        } else if self.in_flight > 0 {
            Poll::Wait(None)
        } else {
            Poll::Exhausted
        }
    }

    /// Moves delayed tasks whose time has come into the ready heap
    ///
    /// Retrying tasks become pending; deferred tasks are already pending.
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            let Some(item) = self.delayed.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&item.key) else {
                continue;
            };
            if entry.seq != item.seq
                || !matches!(entry.state, TaskState::Retrying | TaskState::Pending)
            {
                continue;
            }

            entry.state = TaskState::Pending;
            self.ready.push(Queued {
                priority: entry.task.priority,
                seq: item.seq,
                key: item.key,
            });
        }
    }

    /// Applies a worker's outcome for an in-flight task
    pub fn report(
        &mut self,
        task: &CrawlTask,
        outcome: TaskOutcome,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Reported {
        let key = task.url.to_string();
        let policy = self.policy;

        let Some(entry) = self.entries.get_mut(&key) else {
            return Reported::Ignored;
        };
        if entry.state != TaskState::InFlight {
            tracing::trace!(url = %key, state = %entry.state, "Ignoring report for task not in flight");
            return Reported::Ignored;
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        let (kind, message, retry_after) = match outcome {
            TaskOutcome::Success => {
                entry.state = TaskState::Success;
                entry.finished_at = Some(now);
                return Reported::Succeeded;
            }
            TaskOutcome::Failed {
                kind,
                message,
                retry_after,
            } => (kind, message, retry_after),
        };

        let prior_attempts = entry.task.attempt_count;
        let attempt = prior_attempts + 1;
        entry.task.attempt_count = attempt;
        entry.history.push(AttemptRecord {
            attempt,
            at: wall,
            kind,
            message,
        });

        if kind.is_retryable() && attempt < policy.max_attempts {
            let delay = policy
                .backoff
                .delay(prior_attempts)
                .max(retry_after.unwrap_or_default());
            entry.state = TaskState::Retrying;

            self.next_seq += 1;
            entry.seq = self.next_seq;
            self.delayed.push(Delayed {
                ready_at: deadline_after(now, delay),
                seq: entry.seq,
                key,
            });
            return Reported::Retrying { attempt, delay };
        }

        entry.state = TaskState::Failed;
        entry.finished_at = Some(now);
        Reported::Failed {
            attempts: attempt,
            history: entry.history.clone(),
        }
    }

    /// Returns an in-flight task to pending without counting an attempt
    pub fn release(&mut self, task: &CrawlTask) -> bool {
        let key = task.url.to_string();
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.state != TaskState::InFlight {
            return false;
        }

        entry.state = TaskState::Pending;
        self.in_flight = self.in_flight.saturating_sub(1);

        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.ready.push(Queued {
            priority: entry.task.priority,
            seq: entry.seq,
            key,
        });
        true
    }

    /// Parks an in-flight task until `until` without counting an attempt
    ///
    /// Used when the task's host cannot take a request yet. The task stays
    /// pending (and checkpointable) but is not dispatched before `until`.
    pub fn defer(&mut self, task: &CrawlTask, until: Instant) -> bool {
        let key = task.url.to_string();
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.state != TaskState::InFlight {
            return false;
        }

        entry.state = TaskState::Pending;
        self.in_flight = self.in_flight.saturating_sub(1);

        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.delayed.push(Delayed {
            ready_at: until,
            seq: entry.seq,
            key,
        });
        true
    }

    pub fn counts(&self) -> FrontierCounts {
        let mut counts = FrontierCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::InFlight => counts.in_flight += 1,
                TaskState::Retrying => counts.retrying += 1,
                TaskState::Success => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Non-terminal tasks in dispatch order, for the checkpoint
    pub fn snapshot(&self) -> Vec<FrontierEntry> {
        let mut live: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.state.is_active())
            .collect();
        live.sort_by_key(|e| (e.task.priority, e.seq));

        live.into_iter()
            .map(|e| FrontierEntry {
                url: e.task.url.to_string(),
                mapping: e.task.mapping.clone(),
                depth: e.task.depth,
                priority: e.task.priority,
                attempt_count: e.task.attempt_count,
            })
            .collect()
    }
}
