use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use playlog::config::Config;
use playlog::source::SpotifySource;
use playlog::stats;
use playlog::storage::{LocalStore, PlayStore};
use playlog::{StopReason, SyncError, SyncMerger, SyncSummary};

#[derive(Parser)]
#[command(name = "playlog")]
#[command(about = "Accumulate Spotify recently-played history into a local store")]
struct Cli {
    /// Path to configuration file (default: ~/.config/playlog/config.toml)
    #[arg(short, long, env = "PLAYLOG_CONFIG")]
    config: Option<PathBuf>,

    /// History database (overrides config file)
    #[arg(long, env = "PLAYLOG_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull recent plays and store the ones not seen before
    Sync {
        /// Maximum pages to request (overrides config file)
        #[arg(long)]
        max_pages: Option<usize>,
        /// Plays per page, at most 50 (overrides config file)
        #[arg(long)]
        page_size: Option<usize>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show stored plays, newest first
    Recent {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
        /// Only plays from the last N days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Aggregate listening statistics
    Stats {
        #[arg(long, default_value_t = 7)]
        days: i64,
        /// Entries in each top list
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("playlog=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env();

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => config.db_path()?,
    };

    match cli.command {
        Command::Sync { max_pages, page_size, json } => {
            let max_pages = max_pages.unwrap_or(config.sync.max_pages);
            let page_size = page_size.unwrap_or(config.sync.page_size);
            run_sync(&config, &db_path, max_pages, page_size, json).await
        }
        Command::Recent { limit, days } => {
            let store = LocalStore::open(&db_path)?;
            show_recent(&store, limit, days).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats { days, top, json } => {
            let store = LocalStore::open(&db_path)?;
            show_stats(&store, days, top, json).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_sync(
    config: &Config,
    db_path: &Path,
    max_pages: usize,
    page_size: usize,
    json: bool,
) -> Result<ExitCode> {
    let summary = sync_history(config, db_path, max_pages, page_size).await;
    report(&summary, json)
}

/// One sync run. Failing to open the store or load credentials ends the run
/// before any request and is reported in the summary like any other error.
async fn sync_history(
    config: &Config,
    db_path: &Path,
    max_pages: usize,
    page_size: usize,
) -> SyncSummary {
    let store: Arc<dyn PlayStore> = match LocalStore::open(db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => return failed_before_start(SyncError::storage(&e)),
    };

    let source = match SpotifySource::from_config(config) {
        Ok(source) => source,
        Err(e) => return failed_before_start(e),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current page");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut merger = SyncMerger::new(source, store)
        .with_page_size(page_size)
        .with_cancel_flag(cancel);
    merger.sync(max_pages).await
}

fn failed_before_start(error: SyncError) -> SyncSummary {
    tracing::error!("Sync could not start: {}", error);
    SyncSummary {
        errors: vec![error],
        stop_reason: StopReason::Failed,
        ..SyncSummary::default()
    }
}

fn report(summary: &SyncSummary, json: bool) -> Result<ExitCode> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("Failed to serialize summary")?
        );
    } else {
        println!("{summary}");
    }

    if summary.has_auth_error() {
        eprintln!("Spotify rejected the stored credentials. Log in again to refresh the token cache.");
        Ok(ExitCode::from(2))
    } else if !summary.is_success() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn window_start(end: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    stats::lookback_start(end, days)
        .with_context(|| format!("--days {days} reaches outside the supported date range"))
}

async fn show_recent(store: &LocalStore, limit: usize, days: Option<i64>) -> Result<()> {
    let entries = match days {
        Some(days) => {
            let end = Utc::now() + Duration::seconds(1);
            let start = window_start(end, days)?;
            let mut entries = store.query_by_time_range(start, end).await?;
            entries.truncate(limit);
            entries
        }
        None => store.recent(limit).await?,
    };

    if entries.is_empty() {
        println!("No plays stored yet.");
        return Ok(());
    }

    for entry in &entries {
        let play = &entry.play;
        println!(
            "{}  {} - {} ({})",
            play.played_at.format("%Y-%m-%d %H:%M:%S"),
            play.track_name,
            play.artists_display(),
            play.album_name
        );
    }
    println!("{} plays shown, {} stored in total", entries.len(), store.count().await?);
    Ok(())
}

async fn show_stats(store: &LocalStore, days: i64, top: usize, json: bool) -> Result<()> {
    let end = Utc::now() + Duration::seconds(1);
    let stats = store.aggregate(window_start(end, days)?, end, top).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    if stats.total_plays == 0 {
        println!("No plays in the last {days} days.");
        return Ok(());
    }

    println!(
        "Last {} days: {} plays, {} unique tracks, {} unique artists",
        days, stats.total_plays, stats.unique_tracks, stats.unique_artists
    );
    println!(
        "Listening time: {} min, average popularity {:.1}",
        stats.total_listening_ms / 60_000,
        stats.avg_popularity
    );

    println!("\nTop tracks:");
    for (i, t) in stats.top_tracks.iter().enumerate() {
        println!("{:>3}. {} - {} ({})", i + 1, t.track_name, t.artists, t.plays);
    }
    println!("\nTop artists:");
    for (i, a) in stats.top_artists.iter().enumerate() {
        println!("{:>3}. {} ({})", i + 1, a.name, a.count);
    }
    if !stats.genres.is_empty() {
        println!("\nGenres:");
        for g in &stats.genres {
            println!("     {} ({})", g.name, g.count);
        }
    }
    println!("\nDaily activity:");
    for d in &stats.daily_activity {
        println!("     {}  {}", d.date, d.plays);
    }
    Ok(())
}
