//! usedcss command line
//!
//! Runs the queue processor on a schedule or once, and gives operators a view
//! into the queue.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;
use usedcss::{
    cache::FsCacheStore,
    config::{Config, LogFormat},
    daemon::Scheduler,
    fetcher::HttpFetcher,
    metrics::ProcessorMetrics,
    processor::{ProcessorConfig, QueueProcessor},
    queue::{Enqueued, QueueStore, SledQueueStore},
    types::{ItemId, ItemStatus, Transition},
};

#[derive(Parser)]
#[command(name = "usedcss")]
#[command(about = "Trim each page's stylesheets down to the rules it uses")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "usedcss.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the queue on the configured interval until interrupted
    Run,

    /// Process a single batch and exit
    Process {
        /// Items to process (defaults to the configured batch size)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Record page views, queueing URLs that are not yet known
    Enqueue {
        /// Page URLs
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show queue counts
    Status {
        /// Output format (text, json, prometheus)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show one queue item
    Show {
        id: ItemId,

        /// Print the optimized CSS as well
        #[arg(long)]
        css: bool,
    },

    /// Return an errored item to pending with its retry counter cleared
    Reset {
        /// Item ids
        #[arg(required_unless_present = "all_dead")]
        ids: Vec<ItemId>,

        /// Reset every dead-lettered item
        #[arg(long)]
        all_dead: bool,
    },

    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(default_value = "usedcss.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    if let Some(data_dir) = cli.data_dir {
        config.storage.cache_dir = data_dir.join("cache").join("used-css");
        config.storage.data_dir = data_dir;
    }

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Run => run_scheduler(config).await,
        Commands::Process { limit } => process_once(config, limit).await,
        Commands::Enqueue { urls } => enqueue_urls(config, urls),
        Commands::Status { format } => show_status(config, &format),
        Commands::Show { id, css } => show_item(config, id, css),
        Commands::Reset { ids, all_dead } => reset_items(config, ids, all_dead),
        Commands::Init { path } => init_config(path),
    }
}

fn init_logging(config: &Config, verbose: u8) -> Result<()> {
    let level = config.logging.level.raised(verbose).to_tracing();
    let builder = FmtSubscriber::builder().with_max_level(level).with_target(false);

    match config.logging.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<SledQueueStore>> {
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to create data directory '{}'",
            config.storage.data_dir.display()
        )
    })?;
    Ok(Arc::new(SledQueueStore::open(&config.storage.data_dir)?))
}

fn build_processor(config: &Config, store: Arc<SledQueueStore>) -> Result<QueueProcessor> {
    let cache = FsCacheStore::open(&config.storage.cache_dir).with_context(|| {
        format!(
            "Failed to open cache directory '{}'",
            config.storage.cache_dir.display()
        )
    })?;
    let fetcher = HttpFetcher::new(&config.fetch).context("Failed to build HTTP client")?;

    Ok(QueueProcessor::new(
        store,
        Arc::new(cache),
        Arc::new(fetcher),
        ProcessorConfig::from_config(config),
    ))
}

async fn run_scheduler(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let processor = Arc::new(build_processor(&config, store.clone())?);

    info!("Data directory: {}", config.storage.data_dir.display());
    info!("Cache directory: {}", config.storage.cache_dir.display());

    let scheduler = Scheduler::new(
        processor.clone(),
        config.queue.batch_size,
        config.schedule.interval(),
    );
    scheduler.run().await?;

    store.flush()?;
    info!(
        "Final metrics: {}",
        serde_json::to_string(&processor.metrics().snapshot())?
    );
    Ok(())
}

async fn process_once(config: Config, limit: Option<usize>) -> Result<()> {
    let store = open_store(&config)?;
    let processor = build_processor(&config, store.clone())?;

    let report = processor
        .process_batch(limit.unwrap_or(config.queue.batch_size))
        .await?;
    store.flush()?;

    println!("\nBatch Report:");
    println!("=============");
    println!("Reclaimed (stale): {}", report.reclaimed);
    println!("Requeued (backoff elapsed): {}", report.requeued);
    println!("Selected: {}", report.selected);
    println!("Completed: {}", report.completed);
    println!("Failed: {}", report.failed);
    println!("Rejected: {}", report.rejected);
    if report.claims_lost > 0 {
        println!("Claimed elsewhere: {}", report.claims_lost);
    }
    if report.store_errors > 0 {
        println!("Store errors: {}", report.store_errors);
    }
    Ok(())
}

fn enqueue_urls(config: Config, urls: Vec<String>) -> Result<()> {
    let store = open_store(&config)?;
    let now = Utc::now();

    for raw in urls {
        if let Err(e) = url::Url::parse(&raw) {
            warn!("Skipping '{}': {}", raw, e);
            continue;
        }
        match store.enqueue(&raw, now)? {
            Enqueued::Created(id) => println!("queued {} as {}", raw, id),
            Enqueued::Existing(id) => println!("touched {} ({})", raw, id),
        }
    }
    store.flush()?;
    Ok(())
}

fn show_status(config: Config, format: &str) -> Result<()> {
    let store = open_store(&config)?;
    let stats = store.stats(config.queue.max_retries)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
        "prometheus" => {
            let metrics = ProcessorMetrics::new();
            metrics.record_queue_stats(&stats);
            print!("{}", metrics.to_prometheus());
        }
        _ => {
            println!("\nQueue Status:");
            println!("=============");
            println!("Data directory: {}", config.storage.data_dir.display());
            println!("Pending: {}", stats.pending);
            println!("Processing: {}", stats.processing);
            println!("Completed: {}", stats.completed);
            println!("Error: {}", stats.error);
            println!("Dead-lettered: {}", stats.dead_lettered);
            if stats.dead_lettered > 0 {
                println!("\nDead-lettered items need `usedcss reset` to be retried:");
                for item in store.scan(ItemStatus::Error)? {
                    if item.is_dead_lettered(config.queue.max_retries) {
                        println!(
                            "  {} {} ({})",
                            item.id,
                            item.url,
                            item.error_message.as_deref().unwrap_or("no message")
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn show_item(config: Config, id: ItemId, with_css: bool) -> Result<()> {
    let store = open_store(&config)?;
    let item = store
        .get(id)?
        .with_context(|| format!("No queue item with id {}", id))?;

    println!("Item {}", item.id);
    println!("URL: {}", item.url);
    println!("Status: {}", item.status);
    println!("Retries: {}/{}", item.retries, config.queue.max_retries);
    println!("Modified: {}", item.modified.to_rfc3339());
    println!("Last accessed: {}", item.last_accessed.to_rfc3339());
    if let Some(message) = &item.error_message {
        println!("Error: {}", message);
    }
    if let Some(hash) = &item.hash {
        println!("Hash: {}", hash);
        println!(
            "Cache file: {}",
            config.storage.cache_dir.join(format!("{}.css", hash)).display()
        );
    }
    if let (true, Some(css)) = (with_css, &item.css) {
        println!("\n{}", css);
    }
    Ok(())
}

fn reset_items(config: Config, mut ids: Vec<ItemId>, all_dead: bool) -> Result<()> {
    let store = open_store(&config)?;

    if all_dead {
        ids.extend(
            store
                .scan(ItemStatus::Error)?
                .into_iter()
                .filter(|item| item.is_dead_lettered(config.queue.max_retries))
                .map(|item| item.id),
        );
    }

    for id in ids {
        match store.update(id, &Transition::Reset, Utc::now()) {
            Ok(item) => println!("reset {} ({})", item.id, item.url),
            Err(e) => warn!("Could not reset {}: {}", id, e),
        }
    }
    store.flush()?;
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let content = format!(
        "# usedcss configuration\n\n{}",
        Config::default().to_toml()?
    );
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;

    println!("Configuration written to: {}", path.display());
    Ok(())
}
