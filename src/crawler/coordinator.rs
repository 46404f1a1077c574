//! Crawler coordinator - run lifecycle and worker pool orchestration
//!
//! This module wires the pipeline together for one run:
//! - Recording the run and seeding (or resuming) the frontier
//! - Spawning the bounded worker pool
//! - Checkpointing unfinished tasks on cancellation
//! - Reporting the run summary

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{Config, RenderMode};
use crate::crawler::fetcher::Fetcher;
use crate::crawler::frontier::{RetryPolicy, TaskRequest};
use crate::crawler::render::Renderer;
use crate::crawler::scheduler::Scheduler;
use crate::crawler::worker::{RunCounters, WorkerContext};
use crate::extract::Extractor;
use crate::storage::{FrontierEntry, RunStatus, StoragePool};
use crate::url::normalize_url;
use crate::{DredgeError, Result};

/// What a finished (or interrupted) run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: i64,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    /// Tasks still pending, retrying or in flight when the run stopped
    pub tasks_not_attempted: usize,
    pub records_new: u64,
    pub records_updated: u64,
    pub records_unchanged: u64,
    pub records_failed: u64,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn records_committed(&self) -> u64 {
        self.records_new + self.records_updated + self.records_unchanged
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}{}", self.run_id, if self.cancelled { " (interrupted)" } else { "" })?;
        writeln!(
            f,
            "  Tasks:   {} succeeded, {} failed, {} not attempted",
            self.tasks_succeeded, self.tasks_failed, self.tasks_not_attempted
        )?;
        write!(
            f,
            "  Records: {} new, {} updated, {} unchanged, {} failed",
            self.records_new, self.records_updated, self.records_unchanged, self.records_failed
        )
    }
}

/// Main crawler coordinator structure
pub struct Coordinator {
    config: Arc<Config>,
    config_hash: String,
    storage: StoragePool,
    fetcher: Arc<Fetcher>,
    extractors: Arc<HashMap<String, Extractor>>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Creates a coordinator: opens the store, compiles every mapping and
    /// builds the fetcher
    ///
    /// # Arguments
    ///
    /// * `config` - The validated configuration
    /// * `config_hash` - Hash of the configuration file, recorded on the run
    /// * `renderer` - Browser renderer for `rendered` mappings, if available
    pub fn new(
        config: Config,
        config_hash: impl Into<String>,
        renderer: Option<Arc<dyn Renderer>>,
    ) -> Result<Self> {
        let storage = StoragePool::open(&config.storage)?;

        let extractors = config
            .mappings
            .iter()
            .map(|m| {
                Extractor::from_mapping(m, config.identity.scope).map(|e| (m.name.clone(), e))
            })
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;

        if renderer.is_none() && config.mappings.iter().any(|m| m.render_mode == RenderMode::Rendered) {
            tracing::warn!("No browser renderer available; rendered mappings will fail");
        }

        let fetcher = Fetcher::new(&config, renderer)?;

        Ok(Self {
            config: Arc::new(config),
            config_hash: config_hash.into(),
            storage,
            fetcher: Arc::new(fetcher),
            extractors: Arc::new(extractors),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the run-level cancellation token
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run when cancelled; unfinished tasks are checkpointed
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn storage(&self) -> &StoragePool {
        &self.storage
    }

    /// Runs the crawl to completion or cancellation
    ///
    /// # Arguments
    ///
    /// * `fresh` - Ignore (and discard) any saved checkpoint and start from the seeds
    ///
    /// # Returns
    ///
    /// * `Ok(RunSummary)` - The run finished or was interrupted cleanly
    /// * `Err(DredgeError::StorageUnavailable)` - Too many consecutive records
    ///   were lost to storage failures
    pub async fn run(&self, fresh: bool) -> Result<RunSummary> {
        let run_id = self.storage.create_run(self.config_hash.clone()).await?;
        tracing::info!(run_id, "Starting crawl run");

        // child token: a storage abort stops this run without touching the caller's token
        let run_cancel = self.cancel.child_token();
        let scheduler = Arc::new(Scheduler::new(
            RetryPolicy::from_config(&self.config.crawler),
            run_cancel.clone(),
        ));

        let seeded = self.seed_frontier(&scheduler, fresh).await?;
        tracing::info!(run_id, tasks = seeded, "Frontier ready");

        let counters = Arc::new(RunCounters::default());
        let context = Arc::new(WorkerContext {
            run_id,
            scheduler: Arc::clone(&scheduler),
            fetcher: Arc::clone(&self.fetcher),
            extractors: Arc::clone(&self.extractors),
            storage: self.storage.clone(),
            counters: Arc::clone(&counters),
            cancel: run_cancel.clone(),
            max_depth: self.config.crawler.max_depth,
            host_backoff: Duration::from_millis(self.config.crawler.base_backoff_ms),
            max_consecutive_failures: self.config.storage.max_consecutive_failures,
        });

        let start_time = Instant::now();
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.crawler.max_concurrent_fetches.max(1) as usize {
            workers.spawn(Arc::clone(&context).run(worker_id));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                // its task stays in flight, so the other workers would wait on it forever
                tracing::error!("Worker task ended abnormally, stopping run: {}", e);
                run_cancel.cancel();
            }
        }

        let counts = scheduler.counts();
        let storage_unavailable = counters.storage_unavailable();
        let cancelled = run_cancel.is_cancelled();

        let status = if storage_unavailable {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };

        if cancelled {
            let snapshot = scheduler.snapshot();
            let saved = snapshot.len();
            match self.storage.save_checkpoint(run_id, snapshot).await {
                Ok(()) => tracing::info!(run_id, tasks = saved, "Checkpointed unfinished tasks"),
                Err(e) => tracing::error!(run_id, "Could not save checkpoint: {}", e),
            }
        }

        if let Err(e) = self.storage.finish_run(run_id, status).await {
            tracing::error!(run_id, "Could not record run status: {}", e);
        }

        let summary = RunSummary {
            run_id,
            tasks_succeeded: counts.succeeded,
            tasks_failed: counts.failed,
            tasks_not_attempted: counts.pending + counts.retrying + counts.in_flight,
            records_new: counters.records_new.load(Ordering::Relaxed),
            records_updated: counters.records_updated.load(Ordering::Relaxed),
            records_unchanged: counters.records_unchanged.load(Ordering::Relaxed),
            records_failed: counters.records_failed.load(Ordering::Relaxed),
            cancelled,
        };

        tracing::info!(
            run_id,
            status = status.to_db_string(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            succeeded = summary.tasks_succeeded,
            failed = summary.tasks_failed,
            not_attempted = summary.tasks_not_attempted,
            new = summary.records_new,
            updated = summary.records_updated,
            unchanged = summary.records_unchanged,
            records_failed = summary.records_failed,
            "Crawl run finished"
        );

        if storage_unavailable {
            return Err(DredgeError::StorageUnavailable {
                consecutive_failures: counters.failures_at_abort(),
            });
        }

        Ok(summary)
    }

    /// Fills the frontier from the saved checkpoint, or from the seeds when
    /// there is none (or `fresh` is set); returns the number of tasks added
    async fn seed_frontier(&self, scheduler: &Scheduler, fresh: bool) -> Result<usize> {
        let checkpoint = if fresh {
            Vec::new()
        } else {
            self.storage.load_checkpoint().await?
        };

        let added = if checkpoint.is_empty() {
            tracing::info!("Seeding frontier with {} seed(s)", self.config.seeds.len());
            self.config
                .seeds
                .iter()
                .filter_map(|seed| match normalize_url(&seed.url) {
                    Ok(url) => Some(TaskRequest::new(url, seed.mapping.clone(), 0, seed.priority)),
                    Err(e) => {
                        tracing::warn!(url = %seed.url, "Skipping seed: {}", e);
                        None
                    }
                })
                .map(|request| scheduler.enqueue(request))
                .filter(|added| *added)
                .count()
        } else {
            tracing::info!("Resuming {} task(s) from checkpoint", checkpoint.len());
            checkpoint
                .into_iter()
                .filter_map(|entry| self.resume_request(entry))
                .map(|request| scheduler.enqueue(request))
                .filter(|added| *added)
                .count()
        };

        // the checkpoint now lives in memory; it is rewritten if this run is interrupted
        self.storage.clear_checkpoint().await?;

        Ok(added)
    }

    fn resume_request(&self, entry: FrontierEntry) -> Option<TaskRequest> {
        if !self.extractors.contains_key(&entry.mapping) {
            tracing::warn!(url = %entry.url, mapping = %entry.mapping, "Dropping checkpointed task with unknown mapping");
            return None;
        }

        let url = match Url::parse(&entry.url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(url = %entry.url, "Dropping checkpointed task: {}", e);
                return None;
            }
        };

        Some(TaskRequest {
            url,
            mapping: entry.mapping,
            depth: entry.depth,
            priority: entry.priority,
            attempt_count: entry.attempt_count,
        })
    }
}

/// Runs a complete crawl with the given cancellation token
///
/// A browser renderer is launched when the `browser` feature is enabled and
/// some mapping renders pages.
///
/// # Example
///
/// ```no_run
/// use dredge::config::load_config_with_hash;
/// use dredge::crawler::run_crawl;
/// use std::path::Path;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (config, hash) = load_config_with_hash(Path::new("dredge.toml"))?;
/// let summary = run_crawl(config, hash, false, CancellationToken::new()).await?;
/// println!("{}", summary);
/// # Ok(())
/// # }
/// ```
pub async fn run_crawl(
    config: Config,
    config_hash: String,
    fresh: bool,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let renderer = launch_renderer(&config).await;
    let coordinator = Coordinator::new(config, config_hash, renderer)?.with_cancel_token(cancel);
    coordinator.run(fresh).await
}

#[cfg(feature = "browser")]
async fn launch_renderer(config: &Config) -> Option<Arc<dyn Renderer>> {
    use crate::crawler::render::ChromeRenderer;

    if !config.mappings.iter().any(|m| m.render_mode == RenderMode::Rendered) {
        return None;
    }

    match ChromeRenderer::launch(&config.render, &config.user_agent.header_value()).await {
        Ok(renderer) => Some(Arc::new(renderer) as Arc<dyn Renderer>),
        Err(e) => {
            tracing::error!("Could not launch browser: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "browser"))]
async fn launch_renderer(config: &Config) -> Option<Arc<dyn Renderer>> {
    if config.mappings.iter().any(|m| m.render_mode == RenderMode::Rendered) {
        tracing::warn!("Rendered mappings need the `browser` feature");
    }
    None
}
