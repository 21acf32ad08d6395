use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One occurrence of a track being played.
///
/// `played_at` is the natural key: the upstream API never reports two plays
/// with the same timestamp for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayEvent {
    pub played_at: DateTime<Utc>,
    pub track_id: String,
    pub track_name: String,
    /// Ordered: the first entry is the primary artist
    pub artist_ids: Vec<String>,
    pub artist_names: Vec<String>,
    pub album_id: String,
    pub album_name: String,
    /// As reported upstream; may be year-only ("1997")
    pub release_date: String,
    pub duration_ms: u64,
    /// 0-100
    pub popularity: u8,
    /// May legitimately be empty when no genre metadata exists
    pub genres: Vec<String>,
}

impl PlayEvent {
    /// Storage key: `played_at` in unix milliseconds.
    pub fn dedup_key(&self) -> u64 {
        millis_key(&self.played_at)
    }

    /// Artist names joined the way the dashboard shows them.
    pub fn artists_display(&self) -> String {
        self.artist_names.join(", ")
    }

    pub fn primary_artist_id(&self) -> Option<&str> {
        self.artist_ids.first().map(String::as_str)
    }
}

/// Clamp to the representable key range. Pre-epoch timestamps collapse to 0.
pub fn millis_key(at: &DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}

/// A persisted play: the event plus the time the store accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub play: PlayEvent,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// Base instant for test timestamps (2024-03-01T12:00:00Z).
    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// A play `minutes_ago` minutes before `base_time()`.
    pub fn play_at(minutes_ago: i64) -> PlayEvent {
        play_with(
            base_time() - chrono::Duration::minutes(minutes_ago),
            &format!("track-{minutes_ago}"),
            &format!("Song {minutes_ago}"),
        )
    }

    pub fn play_with(played_at: DateTime<Utc>, track_id: &str, track_name: &str) -> PlayEvent {
        PlayEvent {
            played_at,
            track_id: track_id.to_string(),
            track_name: track_name.to_string(),
            artist_ids: vec!["artist-1".to_string()],
            artist_names: vec!["Artist One".to_string()],
            album_id: "album-1".to_string(),
            album_name: "Album One".to_string(),
            release_date: "2020-01-01".to_string(),
            duration_ms: 180_000,
            popularity: 50,
            genres: Vec::new(),
        }
    }

    /// `count` plays one minute apart, newest first, starting `offset` minutes ago.
    pub fn plays_newest_first(offset: i64, count: i64) -> Vec<PlayEvent> {
        (offset..offset + count).map(play_at).collect()
    }
}
