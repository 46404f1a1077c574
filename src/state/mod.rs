//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `TaskState`: the per-task state machine driven by the scheduler
//! - `HostState`: per-host pacing used by the fetch rate limiter

mod host_state;
mod task_state;

pub use host_state::HostState;
pub use task_state::TaskState;
