//! Read-side aggregation over stored plays, as consumed by the dashboard.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::model::HistoryEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackCount {
    pub track_name: String,
    pub artists: String,
    pub plays: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub plays: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListeningStats {
    pub total_plays: u64,
    pub unique_tracks: u64,
    pub unique_artists: u64,
    pub total_listening_ms: u64,
    pub avg_popularity: f64,
    pub top_tracks: Vec<TrackCount>,
    pub top_artists: Vec<NamedCount>,
    pub genres: Vec<NamedCount>,
    /// UTC calendar days, ascending
    pub daily_activity: Vec<DayCount>,
}

/// Start of a window reaching `days` back from `end`, or None when that
/// falls outside the representable time range.
pub fn lookback_start(end: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    end.checked_sub_signed(Duration::try_days(days)?)
}

/// Aggregate `entries` into dashboard statistics, keeping the `top_n` most
/// played tracks, artists and genres.
pub fn aggregate(entries: &[HistoryEntry], top_n: usize) -> ListeningStats {
    if entries.is_empty() {
        return ListeningStats::default();
    }

    let mut tracks: HashMap<(String, String), u64> = HashMap::new();
    let mut artists: HashMap<String, u64> = HashMap::new();
    let mut genres: HashMap<String, u64> = HashMap::new();
    let mut days: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    let mut track_ids: HashSet<String> = HashSet::new();
    let mut total_listening_ms = 0u64;
    let mut popularity_sum = 0u64;

    for entry in entries {
        let play = &entry.play;
        let track_key = (play.track_name.clone(), play.artists_display());
        // Legacy rows may lack a track id; fall back to name + artists
        track_ids.insert(if play.track_id.is_empty() {
            format!("{}\u{1f}{}", track_key.0, track_key.1)
        } else {
            play.track_id.clone()
        });
        *tracks.entry(track_key).or_default() += 1;

        for artist in &play.artist_names {
            *artists.entry(artist.clone()).or_default() += 1;
        }
        for genre in &play.genres {
            let genre = genre.trim();
            if !genre.is_empty() {
                *genres.entry(genre.to_string()).or_default() += 1;
            }
        }
        *days.entry(play.played_at.date_naive()).or_default() += 1;
        total_listening_ms += play.duration_ms;
        popularity_sum += u64::from(play.popularity);
    }

    let total_plays = entries.len() as u64;

    let mut top_tracks: Vec<TrackCount> = tracks
        .into_iter()
        .map(|((track_name, artists), plays)| TrackCount { track_name, artists, plays })
        .collect();
    top_tracks.sort_by(|a, b| {
        b.plays
            .cmp(&a.plays)
            .then_with(|| a.track_name.cmp(&b.track_name))
            .then_with(|| a.artists.cmp(&b.artists))
    });
    top_tracks.truncate(top_n);

    ListeningStats {
        total_plays,
        unique_tracks: track_ids.len() as u64,
        unique_artists: artists.len() as u64,
        total_listening_ms,
        avg_popularity: popularity_sum as f64 / total_plays as f64,
        top_tracks,
        top_artists: top_counts(artists, top_n),
        genres: top_counts(genres, top_n),
        daily_activity: days
            .into_iter()
            .map(|(date, plays)| DayCount { date, plays })
            .collect(),
    }
}

fn top_counts(counts: HashMap<String, u64>, top_n: usize) -> Vec<NamedCount> {
    let mut out: Vec<NamedCount> = counts
        .into_iter()
        .map(|(name, count)| NamedCount { name, count })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    out.truncate(top_n);
    out
}
