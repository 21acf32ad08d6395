use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR: &str = "playlog";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spotify: SpotifyConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

/// Spotify Web API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    /// Token cache JSON (empty = default config dir)
    pub credentials_path: Option<String>,
    pub api_base_url: String,
    pub accounts_base_url: String,
    /// Look up genres of each play's primary artist
    pub fetch_genres: bool,
    /// Artist genre lookups kept per run
    pub genre_cache_size: usize,
    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            credentials_path: None,
            api_base_url: "https://api.spotify.com".to_string(),
            accounts_base_url: "https://accounts.spotify.com".to_string(),
            fetch_genres: true,
            genre_cache_size: 256,
            request_timeout_secs: 30,
        }
    }
}

/// Sync run limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum pages requested per run
    pub max_pages: usize,
    /// Plays per page (upstream maximum is 50)
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pages: 20,
            page_size: 50,
        }
    }
}

/// History store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb file (empty = default data dir)
    pub db_path: Option<String>,
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR);

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Load configuration from the default file, or create it if missing
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Apply environment-derived overrides.
    ///
    /// CI runners skip genre lookups: one extra request per play is too slow
    /// for scheduled jobs.
    pub fn apply_env(&mut self) {
        if is_ci() {
            tracing::info!("CI environment detected, skipping genre lookups");
            self.spotify.fetch_genres = false;
        }
    }

    pub fn credentials_path(&self) -> Result<PathBuf> {
        match &self.spotify.credentials_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(Self::config_dir()?.join("credentials.json")),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        if let Some(p) = &self.storage.db_path {
            return Ok(PathBuf::from(p));
        }
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join(APP_DIR);
        fs::create_dir_all(&data_dir)
            .context("Failed to create data directory")?;
        Ok(data_dir.join("history.redb"))
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn is_ci() -> bool {
    let flag = |name: &str| std::env::var(name).map(|v| v == "true").unwrap_or(false);
    flag("CI") || flag("GITHUB_ACTIONS")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.sync.max_pages, 20);
        assert_eq!(config.sync.page_size, 50);
        assert!(config.spotify.fetch_genres);
        assert_eq!(config.spotify.api_base_url, "https://api.spotify.com");
        assert!(config.storage.db_path.is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[sync]
max_pages = 3
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.sync.max_pages, 3);
        assert_eq!(config.sync.page_size, 50);
        assert!(config.spotify.fetch_genres);
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[spotify]
credentials_path = "/secrets/spotify.json"
api_base_url = "http://localhost:9000"
accounts_base_url = "http://localhost:9001"
fetch_genres = false
genre_cache_size = 16
request_timeout_secs = 5

[sync]
max_pages = 1
page_size = 25

[storage]
db_path = "/var/lib/playlog/history.redb"
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.spotify.credentials_path.as_deref(), Some("/secrets/spotify.json"));
        assert_eq!(config.spotify.api_base_url, "http://localhost:9000");
        assert!(!config.spotify.fetch_genres);
        assert_eq!(config.spotify.genre_cache_size, 16);
        assert_eq!(config.sync.page_size, 25);
        assert_eq!(
            config.db_path().unwrap(),
            PathBuf::from("/var/lib/playlog/history.redb")
        );
        assert_eq!(
            config.credentials_path().unwrap(),
            PathBuf::from("/secrets/spotify.json")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.sync.max_pages = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sync.max_pages, 7);
    }

    #[test]
    fn test_load_from_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from(&dir.path().join("nope.toml")).is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let example = Config::example_config();
        let parsed: Result<Config, _> = toml::from_str(&example);
        assert!(parsed.is_ok(), "Example config should be valid TOML");
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let result: Result<Config, _> = toml::from_str("this is not valid [[ toml");
        assert!(result.is_err());
    }
}
