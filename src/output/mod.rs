//! Output module for reporting on the entity store
//!
//! This module handles:
//! - Loading entity, run and failure statistics for `--stats`
//! - Printing them for the terminal

pub mod stats;

pub use stats::{load_statistics, print_statistics, CrawlStatistics};
