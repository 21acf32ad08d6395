//! playlog-db — JSON-lines RPC server over the listening history.
//!
//! Runs as a co-process for the dashboard, which only ever reads. The
//! database is opened per request so a concurrent `playlog sync` can take
//! the file lock between requests.
//! Usage: playlog-db serve <db_path>

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use playlog::history_db::PlayHistoryDb;
use playlog::stats;

const DEFAULT_TOP_N: usize = 10;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("playlog=warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 || args[1] != "serve" {
        eprintln!("Usage: playlog-db serve <db_path>");
        std::process::exit(1);
    }

    let db_path = PathBuf::from(&args[2]);

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) if !l.trim().is_empty() => l,
            Ok(_) => continue,
            Err(_) => break,
        };

        let resp = match serde_json::from_str::<Value>(&line) {
            Ok(cmd) => handle(&db_path, &cmd),
            Err(e) => json!({"error": e.to_string()}),
        };

        serde_json::to_writer(&mut out, &resp)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

fn handle(db_path: &Path, cmd: &Value) -> Value {
    let run: fn(&PlayHistoryDb, &Value) -> Result<Value> =
        match cmd.get("cmd").and_then(|v| v.as_str()) {
            Some("count") => cmd_count,
            Some("latest") => cmd_latest,
            Some("recent") => cmd_recent,
            Some("range") => cmd_range,
            Some("stats") => cmd_stats,
            _ => return json!({"error": "unknown command"}),
        };
    // Dropped at the end of the request, releasing the file lock.
    let result = PlayHistoryDb::create(db_path)
        .with_context(|| format!("Failed to open history at {}", db_path.display()))
        .and_then(|db| run(&db, cmd));
    result.unwrap_or_else(|e| json!({"error": format!("{e:#}")}))
}

fn cmd_count(db: &PlayHistoryDb, _cmd: &Value) -> Result<Value> {
    Ok(json!({"count": db.count()?}))
}

fn cmd_latest(db: &PlayHistoryDb, _cmd: &Value) -> Result<Value> {
    Ok(json!({"played_at": db.latest_played_at()?}))
}

fn cmd_recent(db: &PlayHistoryDb, cmd: &Value) -> Result<Value> {
    let limit = cmd["limit"].as_u64().unwrap_or(15) as usize;
    Ok(json!({"plays": db.recent(limit)?}))
}

fn cmd_range(db: &PlayHistoryDb, cmd: &Value) -> Result<Value> {
    let (start, end) = time_window(cmd)?;
    Ok(json!({"plays": db.range(start, end)?}))
}

fn cmd_stats(db: &PlayHistoryDb, cmd: &Value) -> Result<Value> {
    let (start, end) = time_window(cmd)?;
    let top_n = cmd["top"].as_u64().map(|n| n as usize).unwrap_or(DEFAULT_TOP_N);
    let entries = db.range(start, end)?;
    Ok(serde_json::to_value(stats::aggregate(&entries, top_n))?)
}

/// `{"start": rfc3339, "end": rfc3339}` or `{"days": n}` back from now.
fn time_window(cmd: &Value) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let end = match cmd["end"].as_str() {
        Some(s) => parse_time(s)?,
        None => Utc::now() + Duration::seconds(1),
    };
    let start = match (cmd["start"].as_str(), cmd["days"].as_i64()) {
        (Some(s), _) => parse_time(s)?,
        (None, Some(days)) => stats::lookback_start(end, days)
            .with_context(|| format!("window of {days} days is out of range"))?,
        (None, None) => end - Duration::days(7),
    };
    Ok((start, end))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp '{s}'"))?
        .with_timezone(&Utc))
}
