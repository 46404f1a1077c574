//! Dredge main entry point
//!
//! This is the command-line interface for the Dredge crawl pipeline.

use anyhow::Context;
use clap::Parser;
use dredge::config::{load_config_with_hash, Config};
use dredge::crawler::run_crawl;
use dredge::output::{load_statistics, print_statistics};
use dredge::storage::SqliteStorage;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Dredge: crawl, extract and deduplicate structured records
///
/// Dredge fetches the configured seed pages (statically or through a
/// headless browser), extracts records with declarative field mappings and
/// keeps one versioned row per identity in a SQLite store.
#[derive(Parser, Debug)]
#[command(name = "dredge")]
#[command(version)]
#[command(about = "Crawl, extract and deduplicate structured records", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume from the saved checkpoint when there is one (default behavior)
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Discard any saved checkpoint and start from the seeds
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_crawl(config, config_hash, cli.fresh).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("dredge=info,warn"),
            1 => EnvFilter::new("dredge=debug,info"),
            2 => EnvFilter::new("dredge=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the validated config and the seeds
fn handle_dry_run(config: &Config) {
    println!("=== Dredge Dry Run ===\n");

    println!("Crawler Configuration:");
    println!("  Max concurrent fetches: {}", config.crawler.max_concurrent_fetches);
    println!("  Per-host delay: {}ms", config.crawler.per_host_delay_ms);
    println!("  Timeout: {}ms", config.crawler.timeout_ms);
    println!(
        "  Retries: {} attempts, backoff {}..{}ms",
        config.crawler.max_attempts, config.crawler.base_backoff_ms, config.crawler.max_backoff_ms
    );
    println!("  Max depth: {}", config.crawler.max_depth);
    println!("  Respect robots.txt: {}", config.crawler.respect_robots);

    println!("\nUser Agent: {}", config.user_agent.header_value());
    println!("\nDatabase: {}", config.storage.database_path);

    println!("\nMappings ({}):", config.mappings.len());
    for mapping in &config.mappings {
        println!(
            "  - {} ({}, {} fields, identity: {})",
            mapping.name,
            mapping.render_mode.as_str(),
            mapping.fields.len(),
            mapping.identity_fields.join(", ")
        );
        for follow in &mapping.follow {
            println!("    follows '{}' -> {}", follow.selector, follow.mapping);
        }
    }

    println!("\nSeeds ({}):", config.seeds.len());
    for seed in &config.seeds {
        println!("  - {} [{}] priority {}", seed.url, seed.mapping, seed.priority);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let storage = SqliteStorage::open_read_only(Path::new(&config.storage.database_path))
        .context("failed to open database")?;
    let stats = load_statistics(&storage)?;

    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, config_hash: String, fresh: bool) -> anyhow::Result<()> {
    if fresh {
        tracing::info!("Starting fresh crawl (ignoring any checkpoint)");
    } else {
        tracing::info!("Starting crawl (will resume from a checkpoint if one exists)");
    }

    tracing::info!(
        "Seeds: {}, mappings: {}",
        config.seeds.len(),
        config.mappings.len()
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight tasks and checkpointing");
            on_signal.cancel();
        }
    });

    match run_crawl(config, config_hash, fresh, cancel).await {
        Ok(summary) => {
            println!("{}", summary);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}
