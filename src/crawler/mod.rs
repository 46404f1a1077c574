//! Crawler module: fetching, scheduling and run orchestration
//!
//! This module contains the core crawling logic, including:
//! - Static HTTP and browser-rendered fetching behind per-host rate limits
//! - The frontier state machine with retry and backoff policy
//! - The worker pool that drives each task through extraction and storage
//! - Overall run coordination, checkpointing and the run summary

mod backoff;
mod coordinator;
mod error;
mod fetcher;
mod frontier;
mod limiter;
mod render;
mod scheduler;
mod worker;

pub use backoff::{deadline_after, ExponentialBackoff};
pub use coordinator::{run_crawl, Coordinator, RunSummary};
pub use error::{BackoffReason, FetchError};
pub use fetcher::{build_http_client, FetchResult, Fetcher};
pub use frontier::{
    AttemptRecord, CrawlTask, FailureKind, Frontier, FrontierCounts, Poll, Reported, RetryPolicy,
    TaskOutcome, TaskRequest,
};
pub use limiter::RateLimiter;
#[cfg(feature = "browser")]
pub use render::ChromeRenderer;
pub use render::{ReadyCondition, RenderedPage, Renderer};
pub use scheduler::Scheduler;
pub use worker::RunCounters;
