//! Async handle over the frontier shared by all workers
//!
//! Workers block in `next()` until a task is dispatchable, every task has
//! finished, or the run is cancelled. Any change to the frontier wakes the
//! waiting workers.

use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::crawler::frontier::{
    CrawlTask, Frontier, FrontierCounts, Poll, Reported, RetryPolicy, TaskOutcome, TaskRequest,
};
use crate::storage::FrontierEntry;

/// Shared scheduler for one crawl run
pub struct Scheduler {
    frontier: Mutex<Frontier>,
    changed: Notify,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            frontier: Mutex::new(Frontier::new(policy)),
            changed: Notify::new(),
            cancel,
        }
    }

    fn with_frontier<R>(&self, f: impl FnOnce(&mut Frontier) -> R) -> R {
        let mut guard = match self.frontier.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Adds a URL to the frontier; returns false for duplicates
    pub fn enqueue(&self, request: TaskRequest) -> bool {
        let added = self.with_frontier(|f| f.enqueue(request, Instant::now()));
        if added {
            self.changed.notify_waiters();
        }
        added
    }

    /// Waits for the next task
    ///
    /// Returns None once the frontier is exhausted (nothing pending and
    /// nothing in flight) or the run has been cancelled.
    pub async fn next(&self) -> Option<CrawlTask> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            // registered before polling so a change between poll and wait is not lost
            let notified = self.changed.notified();

            let deadline = match self.with_frontier(|f| f.poll(Instant::now())) {
                Poll::Ready(task) => return Some(task),
                Poll::Exhausted => {
                    self.changed.notify_waiters();
                    return None;
                }
                Poll::Wait(deadline) => deadline,
            };

            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = notified => {}
                _ = sleep => {}
            }
        }
    }

    /// Records a worker's outcome for `task`
    pub fn report(&self, task: &CrawlTask, outcome: TaskOutcome) -> Reported {
        let reported = self.with_frontier(|f| f.report(task, outcome, Instant::now(), Utc::now()));
        self.changed.notify_waiters();
        reported
    }

    /// Parks `task` until its host can take a request again
    pub fn defer(&self, task: &CrawlTask, until: Instant) {
        if self.with_frontier(|f| f.defer(task, until)) {
            self.changed.notify_waiters();
        }
    }

    /// Puts an unattempted task back (used when the run is cancelled)
    pub fn release(&self, task: &CrawlTask) {
        if self.with_frontier(|f| f.release(task)) {
            self.changed.notify_waiters();
        }
    }

    pub fn counts(&self) -> FrontierCounts {
        self.with_frontier(|f| f.counts())
    }

    pub fn snapshot(&self) -> Vec<FrontierEntry> {
        self.with_frontier(|f| f.snapshot())
    }
}
