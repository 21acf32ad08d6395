//! Durable listening history backed by redb.
//!
//! One table, keyed by `played_at` in unix milliseconds:
//!   listening_history:  played_at_ms → StoredPlay (JSON)
//!
//! The key doubles as the uniqueness constraint and the time-range index.
//! Rows are never updated or deleted.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::model::{millis_key, HistoryEntry, PlayEvent};

const HISTORY_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("listening_history");

const SCHEMA_VERSION: u32 = 2;

/// Serialized form stored as JSON bytes in redb.
///
/// Fields added after version 1 carry `#[serde(default)]` so older rows
/// still decode; they are never backfilled.
#[derive(Serialize, Deserialize)]
struct StoredPlay {
    #[serde(default = "legacy_version")]
    schema_version: u32,
    played_at_ms: u64,
    created_at_ms: u64,
    #[serde(default)]
    track_id: String,
    track_name: String,
    #[serde(default)]
    artist_ids: Vec<String>,
    artist_names: Vec<String>,
    #[serde(default)]
    album_id: String,
    album_name: String,
    release_date: String,
    #[serde(default)]
    duration_ms: u64,
    popularity: u8,
    genres: Vec<String>,
}

fn legacy_version() -> u32 {
    1
}

impl StoredPlay {
    fn from_play(play: &PlayEvent, created_at_ms: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            played_at_ms: play.dedup_key(),
            created_at_ms,
            track_id: play.track_id.clone(),
            track_name: play.track_name.clone(),
            artist_ids: play.artist_ids.clone(),
            artist_names: play.artist_names.clone(),
            album_id: play.album_id.clone(),
            album_name: play.album_name.clone(),
            release_date: play.release_date.clone(),
            duration_ms: play.duration_ms,
            popularity: play.popularity,
            genres: play.genres.clone(),
        }
    }

    fn into_history_entry(self, key: u64) -> HistoryEntry {
        let played_at = from_millis(key);
        let created_at = from_millis(self.created_at_ms);
        HistoryEntry {
            play: PlayEvent {
                played_at,
                track_id: self.track_id,
                track_name: self.track_name,
                artist_ids: self.artist_ids,
                artist_names: self.artist_names,
                album_id: self.album_id,
                album_name: self.album_name,
                release_date: self.release_date,
                duration_ms: self.duration_ms,
                popularity: self.popularity,
                genres: self.genres,
            },
            created_at,
        }
    }
}

fn from_millis(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_default()
}

fn decode(key: u64, bytes: &[u8]) -> Option<HistoryEntry> {
    match serde_json::from_slice::<StoredPlay>(bytes) {
        Ok(stored) => Some(stored.into_history_entry(key)),
        Err(e) => {
            tracing::warn!("Skipping undecodable history row {}: {}", key, e);
            None
        }
    }
}

pub struct PlayHistoryDb {
    db: Database,
}

impl PlayHistoryDb {
    /// Open or create the history database at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create history directory")?;
            }
        }
        let db = Database::create(path)
            .with_context(|| format!("Failed to open history database at {}", path.display()))?;
        // Ensure table exists
        let txn = db.begin_write()?;
        { let _ = txn.open_table(HISTORY_TABLE)?; }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Open an existing database read-side. Returns None if the file doesn't
    /// exist (no sync has run yet).
    pub fn open(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::create(path).map(Some)
    }

    /// Insert `play` unless a play with the same `played_at` is stored.
    ///
    /// Check and insert happen in one write transaction; redb admits one
    /// writer at a time, so racing inserts of a key produce exactly one `true`.
    pub fn insert_if_absent(&self, play: &PlayEvent) -> Result<bool> {
        let key = play.dedup_key();
        let created_at_ms = Utc::now().timestamp_millis().max(0) as u64;
        let json = serde_json::to_vec(&StoredPlay::from_play(play, created_at_ms))
            .context("Failed to serialize play")?;

        let txn = self.db.begin_write()
            .context("Failed to begin write transaction")?;
        let inserted = {
            let mut table = txn.open_table(HISTORY_TABLE)?;
            if table.get(key)?.is_some() {
                false
            } else {
                table.insert(key, json.as_slice())?;
                true
            }
        };
        if inserted {
            txn.commit().context("Failed to commit play")?;
        } else {
            txn.abort()?;
        }
        Ok(inserted)
    }

    /// Plays with `start <= played_at < end`, most recent first.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<HistoryEntry>> {
        let (lo, hi) = (millis_key(&start), millis_key(&end));
        if lo >= hi {
            return Ok(Vec::new());
        }
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(HISTORY_TABLE)?;
        let mut entries = Vec::new();
        for item in table.range(lo..hi)?.rev() {
            let (key, val) = item?;
            if let Some(entry) = decode(key.value(), val.value()) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// The `limit` most recent plays, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(HISTORY_TABLE)?;
        let mut entries = Vec::with_capacity(limit.min(1024));
        for item in table.iter()?.rev() {
            if entries.len() >= limit {
                break;
            }
            let (key, val) = item?;
            if let Some(entry) = decode(key.value(), val.value()) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn count(&self) -> Result<u64> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(HISTORY_TABLE)?;
        Ok(table.len()?)
    }

    /// Newest stored `played_at`, if any.
    pub fn latest_played_at(&self) -> Result<Option<DateTime<Utc>>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(HISTORY_TABLE)?;
        let last = table.last()?;
        Ok(last.map(|(key, _)| from_millis(key.value())))
    }

    #[cfg(test)]
    fn insert_raw(&self, key: u64, json: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(HISTORY_TABLE)?;
            table.insert(key, json)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use std::sync::Arc;

    fn temp_db() -> (tempfile::TempDir, PlayHistoryDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = PlayHistoryDb::create(&dir.path().join("history.redb")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_db_init() {
        let (_dir, db) = temp_db();
        assert_eq!(db.count().unwrap(), 0);
        assert!(db.recent(100).unwrap().is_empty());
        assert!(db.latest_played_at().unwrap().is_none());
    }

    #[test]
    fn test_insert_and_read_back() {
        let (_dir, db) = temp_db();
        let mut play = play_at(0);
        play.genres = vec!["shoegaze".to_string()];
        play.artist_names = vec!["A".to_string(), "B".to_string()];

        assert!(db.insert_if_absent(&play).unwrap());

        let entries = db.recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].play, play);
        assert!(entries[0].created_at >= play.played_at);
    }

    #[test]
    fn test_duplicate_played_at_is_ignored() {
        let (_dir, db) = temp_db();
        let first = play_with(base_time(), "1", "First");
        let second = play_with(base_time(), "2", "Second");

        assert!(db.insert_if_absent(&first).unwrap());
        assert!(!db.insert_if_absent(&second).unwrap());
        assert!(!db.insert_if_absent(&first).unwrap());

        assert_eq!(db.count().unwrap(), 1);
        // The first writer wins; rows are never updated.
        assert_eq!(db.recent(1).unwrap()[0].play.track_name, "First");
    }

    #[test]
    fn test_ordering_most_recent_first() {
        let (_dir, db) = temp_db();
        for play in plays_newest_first(0, 5).into_iter().rev() {
            db.insert_if_absent(&play).unwrap();
        }

        let entries = db.recent(10).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].play.track_id, "track-0");
        assert_eq!(entries[4].play.track_id, "track-4");
        assert_eq!(db.latest_played_at().unwrap(), Some(base_time()));
    }

    #[test]
    fn test_limit() {
        let (_dir, db) = temp_db();
        for play in plays_newest_first(0, 10) {
            db.insert_if_absent(&play).unwrap();
        }
        assert_eq!(db.recent(5).unwrap().len(), 5);
    }

    #[test]
    fn test_range_is_half_open() {
        let (_dir, db) = temp_db();
        for play in plays_newest_first(0, 10) {
            db.insert_if_absent(&play).unwrap();
        }

        let start = base_time() - chrono::Duration::minutes(5);
        let end = base_time() - chrono::Duration::minutes(2);
        let entries = db.range(start, end).unwrap();

        let ids: Vec<_> = entries.iter().map(|e| e.play.track_id.as_str()).collect();
        assert_eq!(ids, vec!["track-3", "track-4", "track-5"]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let (_dir, db) = temp_db();
        db.insert_if_absent(&play_at(0)).unwrap();
        let entries = db.range(base_time(), base_time() - chrono::Duration::hours(1)).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.redb");
        {
            let db = PlayHistoryDb::create(&path).unwrap();
            db.insert_if_absent(&play_at(0)).unwrap();
        }
        let db = PlayHistoryDb::open(&path).unwrap().unwrap();
        assert_eq!(db.count().unwrap(), 1);
        assert!(!db.insert_if_absent(&play_at(0)).unwrap());
    }

    #[test]
    fn test_open_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PlayHistoryDb::open(&dir.path().join("missing.redb")).unwrap().is_none());
    }

    #[test]
    fn test_legacy_rows_decode_without_backfill() {
        let (_dir, db) = temp_db();
        let key = base_time().timestamp_millis() as u64;
        let legacy = serde_json::json!({
            "played_at_ms": key,
            "created_at_ms": key,
            "track_name": "Old Song",
            "artist_names": ["Old Artist"],
            "album_name": "Old Album",
            "release_date": "1999",
            "popularity": 12,
            "genres": []
        });
        db.insert_raw(key, &serde_json::to_vec(&legacy).unwrap()).unwrap();

        let entry = &db.recent(1).unwrap()[0];
        assert_eq!(entry.play.track_name, "Old Song");
        assert_eq!(entry.play.track_id, "");
        assert!(entry.play.artist_ids.is_empty());
        assert_eq!(entry.play.duration_ms, 0);
    }

    #[test]
    fn test_unicode_metadata() {
        let (_dir, db) = temp_db();
        let mut play = play_at(0);
        play.track_name = "日本語タイトル".to_string();
        play.artist_names = vec!["アーティスト".to_string()];
        play.album_name = "Альбом".to_string();

        db.insert_if_absent(&play).unwrap();
        let entries = db.recent(10).unwrap();

        assert_eq!(entries[0].play.track_name, "日本語タイトル");
        assert_eq!(entries[0].play.artist_names, vec!["アーティスト".to_string()]);
        assert_eq!(entries[0].play.album_name, "Альбом");
    }

    #[test]
    fn test_concurrent_inserts_have_one_winner() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let plays = plays_newest_first(0, 20);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                let plays = plays.clone();
                std::thread::spawn(move || {
                    plays
                        .iter()
                        .filter(|p| db.insert_if_absent(p).unwrap())
                        .count()
                })
            })
            .collect();

        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 20);
        assert_eq!(db.count().unwrap(), 20);
    }
}
