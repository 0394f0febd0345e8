//! pagepulse - page-view ingestion and site settings CLI

mod cli;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cli::IngestSummary;
use pagepulse_core::buffer::{EventBuffer, FlushOutcome};
use pagepulse_core::cache::TtlCache;
use pagepulse_core::config::{PulseConfig, CONFIG_FILE_NAME};
use pagepulse_core::query::CachedQueries;
use pagepulse_core::settings::SiteSettings;
use pagepulse_core::store::SqliteEventStore;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pagepulse",
    version,
    about = "Page-view ingestion and site settings",
    long_about = "Buffers page-view events and writes them to SQLite in batches.\n\
                  \n\
                  Examples:\n\
                    pagepulse ingest < views.jsonl         # Ingest JSON-lines events from stdin\n\
                    pagepulse ingest --file views.jsonl    # Ingest from a file\n\
                    pagepulse stats --top 5                # Total views + top articles\n\
                    pagepulse config set site_name Blog    # Store a site setting\n\
                    pagepulse config list --json           # Dump all settings\n\
                  \n\
                  Environment Variables:\n\
                    PAGEPULSE_CONFIG                       # Config file (default: ./pagepulse.toml)\n\
                    PAGEPULSE_DB                           # Database path override\n\
                    PAGEPULSE_NO_COLOR                     # Disable ANSI colors\n\
                    RUST_LOG                               # Log filter (default: info)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file
    #[arg(long, env = "PAGEPULSE_CONFIG", default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// SQLite database path (overrides storage.database_path)
    #[arg(long, env = "PAGEPULSE_DB")]
    db: Option<PathBuf>,

    /// Pending events that trigger an immediate flush
    #[arg(long)]
    capacity: Option<usize>,

    /// Seconds before buffered events are flushed
    #[arg(long)]
    flush_interval_secs: Option<u64>,

    /// Disable ANSI colors (log-friendly)
    #[arg(long, env = "PAGEPULSE_NO_COLOR")]
    no_color: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON-lines view events and persist them through the buffer
    Ingest {
        /// Input file (default: stdin)
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show view totals, top articles and daily counts
    Stats {
        /// Number of top articles
        #[arg(long, short = 'n', default_value = "10")]
        top: usize,
        /// Number of days in the daily breakdown
        #[arg(long, short = 'd', default_value = "7")]
        days: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read or change site settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Check that the database answers
    Check,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one setting
    Get { key: String },
    /// Store one setting
    Set { key: String, value: String },
    /// Print all settings
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Logs go to stderr so command output stays pipeable
fn init_tracing(no_color: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive("pagepulse=debug".parse()?)
            .add_directive("pagepulse_core=debug".parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_target(false)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.no_color)?;

    let mut config = PulseConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.storage.database_path = Some(db);
    }
    if let Some(capacity) = cli.capacity {
        config.buffer.capacity = capacity;
    }
    if let Some(secs) = cli.flush_interval_secs {
        config.buffer.flush_interval_secs = secs;
    }
    config.validate().context("Invalid configuration")?;

    let db_path = config
        .database_path()
        .context("Could not determine database path")?;
    debug!(db = %db_path.display(), "Opening event store");
    let store = Arc::new(SqliteEventStore::open(&db_path, config.store_config())?);
    let cache = Arc::new(TtlCache::<Value>::new(config.cache_ttl()));

    let no_color = cli.no_color;

    match cli.command {
        Command::Ingest { file, json } => {
            run_ingest(store, &config, file, json).await?;
        }
        Command::Stats { top, days, json } => {
            let queries = CachedQueries::new(store, cache);
            run_stats(&queries, top, days, json, no_color).await?;
        }
        Command::Config { action } => {
            let settings = SiteSettings::new(store, cache);
            run_config(&settings, action, no_color).await?;
        }
        Command::Check => {
            if !store.health_check().await {
                bail!("Database check failed: {}", db_path.display());
            }
            println!("OK: {}", db_path.display());
        }
    }

    Ok(())
}

async fn run_ingest(
    store: Arc<SqliteEventStore>,
    config: &PulseConfig,
    file: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let buffer = EventBuffer::new(store, config.buffer_config())?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input: {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();

    let mut summary = IngestSummary::default();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut watch_interrupt = true;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    break;
                };
                summary.lines += 1;
                match cli::parse_event_line(&line) {
                    Ok(Some(event)) => {
                        buffer.enqueue(event);
                        summary.enqueued += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(line = summary.lines, error = %e, "Skipping malformed event");
                        summary.skipped += 1;
                    }
                }
            }
            result = &mut interrupt, if watch_interrupt => {
                match result {
                    Ok(()) => {
                        info!("Interrupted, flushing buffered events");
                        summary.interrupted = true;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot listen for Ctrl-C, continuing without it");
                        watch_interrupt = false;
                    }
                }
            }
        }
    }

    let outcome = buffer.shutdown().await;
    let stats = buffer.stats();
    println!(
        "{}",
        cli::format_ingest_summary(&summary, outcome, &stats, json)
    );

    if let FlushOutcome::Requeued(count) = outcome {
        bail!("{} events could not be persisted", count);
    }
    Ok(())
}

async fn run_stats(
    queries: &CachedQueries,
    top: usize,
    days: usize,
    json: bool,
    no_color: bool,
) -> Result<()> {
    let total = queries
        .total_views()
        .await
        .context("Failed to count views")?;
    let top_articles = queries
        .top_articles(top)
        .await
        .context("Failed to load top articles")?;
    let daily = queries
        .daily_views(days)
        .await
        .context("Failed to load daily views")?;

    println!(
        "{}",
        cli::format_stats(total, &top_articles, &daily, json, no_color)
    );
    Ok(())
}

async fn run_config(settings: &SiteSettings, action: ConfigAction, no_color: bool) -> Result<()> {
    match action {
        ConfigAction::Get { key } => match settings.get(&key).await {
            Some(value) => println!("{}", value),
            None => bail!("Setting not found: {}", key),
        },
        ConfigAction::Set { key, value } => {
            if !settings.set(&key, &value).await {
                bail!("Failed to store setting: {}", key);
            }
            println!("{} = {}", key, value);
        }
        ConfigAction::List { json } => {
            let all = settings.all().await;
            println!("{}", cli::format_settings(&all, json, no_color));
        }
    }
    Ok(())
}
