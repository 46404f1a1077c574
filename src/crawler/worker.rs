//! A crawl worker: fetch, extract, follow and commit one task at a time

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::crawler::error::FetchError;
use crate::crawler::fetcher::Fetcher;
use crate::crawler::frontier::{CrawlTask, FailureKind, Reported, TaskOutcome, TaskRequest};
use crate::crawler::scheduler::Scheduler;
use crate::dedup::Classification;
use crate::extract::{Extractor, Record};
use crate::storage::{FailureRecord, StorageError, StoragePool};
use crate::url::host_key;

/// Record counters shared by every worker of a run
#[derive(Debug, Default)]
pub struct RunCounters {
    pub records_new: AtomicU64,
    pub records_updated: AtomicU64,
    pub records_unchanged: AtomicU64,
    pub records_failed: AtomicU64,
    /// Records lost in a row to exhausted storage retries
    consecutive_storage_failures: AtomicU32,
    storage_unavailable: AtomicBool,
    /// Consecutive losses that triggered the abort
    failures_at_abort: AtomicU32,
}

impl RunCounters {
    fn record_committed(&self, classification: &Classification) {
        let counter = match classification {
            Classification::New => &self.records_new,
            Classification::Updated { .. } => &self.records_updated,
            Classification::Unchanged => &self.records_unchanged,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.consecutive_storage_failures.store(0, Ordering::Relaxed);
    }

    /// Counts a lost record; returns the current run of consecutive losses
    /// when the loss was a connectivity failure
    fn record_lost(&self, error: &StorageError) -> Option<u32> {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
        matches!(error, StorageError::Exhausted { .. })
            .then(|| self.consecutive_storage_failures.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn storage_unavailable(&self) -> bool {
        self.storage_unavailable.load(Ordering::Relaxed)
    }

    pub fn consecutive_storage_failures(&self) -> u32 {
        self.consecutive_storage_failures.load(Ordering::Relaxed)
    }

    pub fn failures_at_abort(&self) -> u32 {
        self.failures_at_abort.load(Ordering::Relaxed)
    }

    /// Flags the run as aborted; returns false if it already was
    fn mark_storage_unavailable(&self, consecutive: u32) -> bool {
        let first = !self.storage_unavailable.swap(true, Ordering::Relaxed);
        if first {
            self.failures_at_abort.store(consecutive, Ordering::Relaxed);
        }
        first
    }
}

/// What becomes of a task a worker picked up
#[derive(Debug)]
enum Step {
    /// The task was attempted
    Report(TaskOutcome),
    /// Its host cannot take a request before this instant
    Defer(Instant),
    /// The run was cancelled before the task was attempted
    Release,
}

impl From<TaskOutcome> for Step {
    fn from(outcome: TaskOutcome) -> Self {
        Self::Report(outcome)
    }
}

/// Everything a worker needs, shared across the pool
pub(crate) struct WorkerContext {
    pub run_id: i64,
    pub scheduler: Arc<Scheduler>,
    pub fetcher: Arc<Fetcher>,
    pub extractors: Arc<HashMap<String, Extractor>>,
    pub storage: StoragePool,
    pub counters: Arc<RunCounters>,
    pub cancel: CancellationToken,
    pub max_depth: u32,
    /// Host backoff applied when a 429 carries no Retry-After
    pub host_backoff: Duration,
    pub max_consecutive_failures: u32,
}

impl WorkerContext {
    /// Pulls tasks until the frontier is exhausted or the run is cancelled
    pub async fn run(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "Worker started");

        while let Some(task) = self.scheduler.next().await {
            if self.cancel.is_cancelled() {
                self.scheduler.release(&task);
                break;
            }

            match self.process(&task).await {
                Step::Report(outcome) => {
                    let reported = self.scheduler.report(&task, outcome);
                    self.handle_report(&task, reported).await;
                }
                Step::Defer(until) => {
                    tracing::trace!(url = %task.url, "Host busy, deferring task");
                    self.scheduler.defer(&task, until);
                }
                Step::Release => {
                    self.scheduler.release(&task);
                    break;
                }
            }
        }

        tracing::debug!(worker_id, "Worker finished");
    }

    async fn process(&self, task: &CrawlTask) -> Step {
        let Some(extractor) = self.extractors.get(&task.mapping) else {
            return TaskOutcome::failed(
                FailureKind::Permanent,
                format!("unknown mapping '{}'", task.mapping),
            )
            .into();
        };

        let ready = self.fetcher.ready_condition(extractor.ready_selector());
        let fetched = match self
            .fetcher
            .fetch(&task.url, extractor.render_mode(), &ready, &self.cancel)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => return self.fetch_failure(task, e),
        };

        // the parsed document is not Send; nothing below may hold it across an await
        let (records, links) = match extractor.extract(&fetched) {
            Ok(page) => (page.records().collect::<Vec<Record>>(), page.follow_links()),
            Err(e) => {
                tracing::warn!(url = %task.url, "{}", e);
                return TaskOutcome::failed(FailureKind::Malformed, e.to_string()).into();
            }
        };

        if records.is_empty() {
            tracing::info!(url = %task.url, mapping = %task.mapping, "Page yielded no records");
        }

        if task.depth < self.max_depth {
            let mut added = 0;
            for link in links {
                let priority = link.priority.unwrap_or(task.priority);
                let request = TaskRequest::new(link.url, link.mapping, task.depth + 1, priority);
                if self.scheduler.enqueue(request) {
                    added += 1;
                }
            }
            if added > 0 {
                tracing::debug!(url = %task.url, added, "Enqueued followed links");
            }
        }

        self.commit_records(task, records).await.into()
    }

    /// Commits records in extraction order; a lost record fails the task but
    /// does not stop the remaining commits
    async fn commit_records(&self, task: &CrawlTask, records: Vec<Record>) -> TaskOutcome {
        let mut lost = 0;
        let mut last_error = None;

        for record in records {
            for diagnostic in &record.diagnostics {
                tracing::warn!(
                    url = %task.url,
                    field = %diagnostic.field,
                    raw = %diagnostic.raw,
                    "Field kept unparsed: {}",
                    diagnostic.message
                );
            }

            let identity_key = record.identity_key.clone();
            match self.storage.commit_record(record).await {
                Ok(outcome) => {
                    tracing::debug!(
                        identity_key = %identity_key,
                        classification = outcome.classification.as_str(),
                        version = outcome.entity.version,
                        "Committed record"
                    );
                    self.counters.record_committed(&outcome.classification);
                }
                Err(e) => {
                    tracing::error!(url = %task.url, identity_key = %identity_key, "Record lost: {}", e);
                    lost += 1;
                    if let Some(consecutive) = self.counters.record_lost(&e) {
                        if consecutive >= self.max_consecutive_failures {
                            self.abort_run(consecutive);
                        }
                    }
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(message) => TaskOutcome::failed(
                FailureKind::Storage,
                format!("{} record(s) not committed: {}", lost, message),
            ),
            None => TaskOutcome::Success,
        }
    }

    fn abort_run(&self, consecutive: u32) {
        if self.counters.mark_storage_unavailable(consecutive) {
            tracing::error!(
                consecutive_failures = consecutive,
                "Storage unavailable, aborting run"
            );
        }
        self.cancel.cancel();
    }

    fn fetch_failure(&self, task: &CrawlTask, error: FetchError) -> Step {
        let outcome = match error {
            FetchError::HostBusy { until, .. } => return Step::Defer(until),
            FetchError::Cancelled { .. } => return Step::Release,
            FetchError::Transient { reason, .. } => TaskOutcome::failed(FailureKind::Transient, reason),
            FetchError::Permanent { reason, .. } => TaskOutcome::failed(FailureKind::Permanent, reason),
            FetchError::Backoff {
                reason,
                retry_after,
                ..
            } => {
                // later tasks for this host are deferred by the scheduler, not slept on
                if let Some(host) = host_key(&task.url) {
                    self.fetcher
                        .limiter()
                        .back_off(&host, retry_after.unwrap_or(self.host_backoff));
                }
                TaskOutcome::Failed {
                    kind: FailureKind::Backoff,
                    message: reason.to_string(),
                    retry_after,
                }
            }
        };
        outcome.into()
    }

    async fn handle_report(&self, task: &CrawlTask, reported: Reported) {
        match reported {
            Reported::Succeeded => {
                tracing::debug!(url = %task.url, "Task succeeded");
            }
            Reported::Retrying { attempt, delay } => {
                tracing::warn!(
                    url = %task.url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Task failed, retrying"
                );
            }
            Reported::Failed { attempts, history } => {
                let last_error = history
                    .last()
                    .map(|a| a.message.clone())
                    .unwrap_or_default();
                tracing::error!(url = %task.url, attempts, "Task failed: {}", last_error);

                let failure = FailureRecord {
                    url: task.url.to_string(),
                    mapping: task.mapping.clone(),
                    attempts,
                    last_error,
                    history,
                    failed_at: Utc::now(),
                };
                if let Err(e) = self.storage.record_failure(self.run_id, failure).await {
                    tracing::warn!(url = %task.url, "Could not record task failure: {}", e);
                }
            }
            Reported::Ignored => {
                tracing::debug!(url = %task.url, "Report ignored for task not in flight");
            }
        }
    }
}
