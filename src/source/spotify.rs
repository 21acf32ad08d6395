//! Spotify Web API recently-played source.
//!
//! Talks HTTP directly with reqwest. Credentials come from a JSON token cache
//! produced by an external OAuth login; this module only refreshes an access
//! token, it never runs the interactive flow.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use reqwest::{Client as HttpClient, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{PlayPage, PlaySource, MAX_PAGE_SIZE};
use crate::config::Config;
use crate::error::SyncError;
use crate::model::PlayEvent;

/// Refresh this long before the cached token expires.
const EXPIRY_MARGIN_SECONDS: i64 = 60;

/// Token cache written by the OAuth login step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyCredentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl SpotifyCredentials {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            SyncError::auth(format!(
                "no Spotify credentials at {} ({e}); log in to create the token cache",
                path.display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            SyncError::auth(format!("corrupt Spotify credentials at {}: {e}", path.display()))
        })
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    fn expires_soon(&self) -> bool {
        self.expires_at
            .map(|at| at <= Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECONDS))
            .unwrap_or(false)
    }
}

// API Response models
#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    #[serde(default)]
    items: Vec<PlayHistoryItem>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: TrackObject,
    played_at: String,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    album: Option<AlbumObject>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    popularity: u32,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AlbumObject {
    id: Option<String>,
    name: String,
    #[serde(default)]
    release_date: String,
}

#[derive(Debug, Deserialize)]
struct FullArtistResponse {
    #[serde(default)]
    genres: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

impl PlayHistoryItem {
    fn into_play(self) -> Option<PlayEvent> {
        let played_at = match DateTime::parse_from_rfc3339(&self.played_at) {
            Ok(at) => at.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(
                    "Skipping play of '{}' with malformed played_at '{}': {}",
                    self.track.name, self.played_at, e
                );
                return None;
            }
        };
        let track = self.track;
        let album = track.album.unwrap_or(AlbumObject {
            id: None,
            name: String::new(),
            release_date: String::new(),
        });
        Some(PlayEvent {
            played_at,
            track_id: track.id.unwrap_or_default(),
            track_name: track.name,
            artist_ids: track
                .artists
                .iter()
                .map(|a| a.id.clone().unwrap_or_default())
                .collect(),
            artist_names: track.artists.into_iter().map(|a| a.name).collect(),
            album_id: album.id.unwrap_or_default(),
            album_name: album.name,
            release_date: album.release_date,
            duration_ms: track.duration_ms,
            popularity: track.popularity.min(100) as u8,
            genres: Vec::new(),
        })
    }
}

pub struct SpotifySource {
    credentials: SpotifyCredentials,
    /// Where refreshed tokens are written back; None keeps them in memory
    credentials_path: Option<PathBuf>,
    http_client: HttpClient,
    api_base: String,
    accounts_base: String,
    fetch_genres: bool,
    genre_cache: LruCache<String, Vec<String>>,
}

impl SpotifySource {
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let path = config.credentials_path().map_err(|e| SyncError::auth(format!("{e:#}")))?;
        let credentials = SpotifyCredentials::load(&path)?;
        let mut source = Self::with_credentials(
            credentials,
            &config.spotify.api_base_url,
            &config.spotify.accounts_base_url,
            StdDuration::from_secs(config.spotify.request_timeout_secs),
        )?;
        source.credentials_path = Some(path);
        source.set_genre_lookup(config.spotify.fetch_genres, config.spotify.genre_cache_size);
        Ok(source)
    }

    pub fn with_credentials(
        credentials: SpotifyCredentials,
        api_base: &str,
        accounts_base: &str,
        timeout: StdDuration,
    ) -> Result<Self, SyncError> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(SyncError::transport)?;
        Ok(Self {
            credentials,
            credentials_path: None,
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            accounts_base: accounts_base.trim_end_matches('/').to_string(),
            fetch_genres: false,
            genre_cache: LruCache::new(NonZeroUsize::MIN),
        })
    }

    pub fn set_genre_lookup(&mut self, enabled: bool, cache_size: usize) {
        self.fetch_genres = enabled;
        let cap = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        self.genre_cache = LruCache::new(cap);
    }

    pub fn credentials(&self) -> &SpotifyCredentials {
        &self.credentials
    }

    async fn get_json<T: DeserializeOwned>(
        &mut self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, SyncError> {
        let mut refreshed = false;
        loop {
            let resp = self
                .http_client
                .get(url)
                .bearer_auth(&self.credentials.access_token)
                .query(query)
                .send()
                .await
                .map_err(|e| SyncError::transport(format!("request to {url} failed: {e}")))?;

            let status = resp.status();
            if status.is_success() {
                return resp.json::<T>().await.map_err(|e| {
                    SyncError::transport(format!("undecodable response from {url}: {e}"))
                });
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed && self.credentials.can_refresh() {
                tracing::warn!("Got 401 from {}, attempting to refresh token...", url);
                self.refresh_token().await?;
                refreshed = true;
                continue;
            }

            let body = resp.text().await.unwrap_or_default();
            let detail = format!("{status} from {url}: {}", truncate(&body, 200));
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::auth(detail),
                _ => SyncError::transport(detail),
            });
        }
    }

    async fn refresh_token(&mut self) -> Result<(), SyncError> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            self.credentials.refresh_token.clone(),
            self.credentials.client_id.as_deref(),
            self.credentials.client_secret.as_deref(),
        ) else {
            return Err(SyncError::auth("token expired and no refresh credentials available"));
        };

        let basic = general_purpose::STANDARD.encode(format!("{client_id}:{client_secret}"));
        let url = format!("{}/api/token", self.accounts_base);
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        let response = self
            .http_client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
            .form(&params)
            .send()
            .await
            .map_err(|e| SyncError::transport(format!("token refresh failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("token refresh rejected ({status}): {}", truncate(&body, 200));
            return Err(if status.is_client_error() {
                SyncError::auth(detail)
            } else {
                SyncError::transport(detail)
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::transport(format!("undecodable token response: {e}")))?;

        self.credentials.access_token = token.access_token;
        if let Some(rotated) = token.refresh_token {
            self.credentials.refresh_token = Some(rotated);
        }
        self.credentials.expires_at = token
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        if let Some(path) = &self.credentials_path {
            if let Err(e) = self.credentials.save(path) {
                tracing::warn!("Could not write refreshed token to {}: {}", path.display(), e);
            }
        }
        tracing::info!("Spotify token refreshed");
        Ok(())
    }

    /// Genres of an artist, cached for the lifetime of this source.
    ///
    /// Failures are logged and yield no genres; genre metadata is optional.
    async fn artist_genres(&mut self, artist_id: &str) -> Vec<String> {
        if let Some(genres) = self.genre_cache.get(artist_id) {
            return genres.clone();
        }
        let url = format!("{}/v1/artists/{}", self.api_base, artist_id);
        match self.get_json::<FullArtistResponse>(&url, &[]).await {
            Ok(artist) => {
                self.genre_cache.put(artist_id.to_string(), artist.genres.clone());
                artist.genres
            }
            Err(e) => {
                tracing::warn!("Error fetching genres for artist {}: {}", artist_id, e);
                Vec::new()
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl PlaySource for SpotifySource {
    fn source_name(&self) -> &str {
        "spotify"
    }

    async fn fetch_plays_before(
        &mut self,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<PlayPage, SyncError> {
        if self.credentials.expires_soon() && self.credentials.can_refresh() {
            self.refresh_token().await?;
        }

        let url = format!("{}/v1/me/player/recently-played", self.api_base);
        let mut query = vec![("limit", limit.clamp(1, MAX_PAGE_SIZE).to_string())];
        if let Some(before) = before {
            query.push(("before", before.timestamp_millis().to_string()));
        }

        let response: RecentlyPlayedResponse = self.get_json(&url, &query).await?;
        let has_more = response.next.is_some();
        let received = response.items.len();
        let mut events: Vec<PlayEvent> = response
            .items
            .into_iter()
            .filter_map(PlayHistoryItem::into_play)
            .collect();

        if self.fetch_genres {
            for event in &mut events {
                let Some(artist_id) = event.primary_artist_id().map(str::to_string) else {
                    continue;
                };
                if artist_id.is_empty() {
                    continue;
                }
                event.genres = self.artist_genres(&artist_id).await;
            }
        }

        tracing::debug!(
            "Spotify returned {} plays, {} usable (before={:?}, has_more={})",
            received,
            events.len(),
            before,
            has_more
        );
        Ok(PlayPage { events, has_more, received })
    }
}
