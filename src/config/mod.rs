//! Configuration module for Dredge
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use dredge::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("dredge.toml")).unwrap();
//! println!("Workers: {}", config.crawler.max_concurrent_fetches);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CrawlerConfig, FieldMapping, FollowRule, IdentityConfig, IdentityScope, PageMapping,
    RenderConfig, RenderMode, SeedEntry, StorageConfig, TransformSpec, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
