//! Configuration management.
//!
//! Configuration is read from `~/.config/podsync/config.toml` at startup.
//! If the file doesn't exist, a default configuration with comments is created.
//! Intervals are written as human strings such as `"5m"`, `"6h"` or `"10d"`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::podcast_index::{API_KEY_ENV, API_SECRET_ENV, DEFAULT_BASE_URL, DEFAULT_MAX_RESULTS};
use crate::directory::Credentials;
use crate::queue::RetryPolicy;
use crate::scheduler::StalenessPolicy;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Where the databases live (default: the platform data dir).
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote authority base URL. Without one a local authority is used.
    pub server_url: Option<String>,
    #[serde(with = "interval")]
    pub poll_interval: Duration,
    pub retry_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            poll_interval: Duration::from_secs(60),
            retry_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "interval")]
    pub interval: Duration,
    #[serde(with = "interval")]
    pub feed_refresh_after: Duration,
    #[serde(with = "interval")]
    pub feed_active_window: Duration,
    #[serde(with = "interval")]
    pub feed_evict_after: Duration,
    #[serde(with = "interval")]
    pub episode_expiry: Duration,
    pub evict_subscribed_feeds: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            feed_refresh_after: Duration::from_secs(6 * 3600),
            feed_active_window: Duration::from_secs(14 * 86400),
            feed_evict_after: Duration::from_secs(30 * 86400),
            episode_expiry: Duration::from_secs(10 * 86400),
            evict_subscribed_feeds: false,
        }
    }
}

impl SchedulerConfig {
    pub fn policy(&self) -> StalenessPolicy {
        let span = |d: Duration| chrono::Duration::seconds(d.as_secs().min(i64::MAX as u64 / 1000) as i64);
        StalenessPolicy {
            refresh_after: span(self.feed_refresh_after),
            active_window: span(self.feed_active_window),
            evict_after: span(self.feed_evict_after),
            episode_expiry: span(self.episode_expiry),
            evict_subscribed: self.evict_subscribed_feeds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    /// Minimum spacing between task starts.
    #[serde(with = "interval")]
    pub min_interval: Duration,
    pub retry_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::queue::DEFAULT_CONCURRENCY,
            min_interval: Duration::from_secs(1),
            retry_attempts: 5,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub max_results: usize,
    pub retry_attempts: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            api_secret: None,
            max_results: DEFAULT_MAX_RESULTS,
            retry_attempts: 3,
        }
    }
}

impl DirectoryConfig {
    /// File values first, then the environment.
    pub fn credentials(&self) -> Option<Credentials> {
        let key = self
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())?;
        let secret = self
            .api_secret
            .clone()
            .or_else(|| std::env::var(API_SECRET_ENV).ok())?;
        Some(Credentials::new(key, secret))
    }
}

impl Config {
    /// Load configuration from the default path, creating it on first run.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Missing fields in the file use default values.
    pub fn load_from(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            Self::create_default_config(config_path)?;
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path).map_err(|e| ConfigError::Io {
            path: config_path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source: e,
        })
    }

    /// `~/.config/podsync/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("podsync").join("config.toml"))
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.cache.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|d| d.join("podsync"))
                .ok_or(ConfigError::NoDataDir),
        }
    }

    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
    }

    fn default_config_content() -> String {
        r##"# podsync configuration
#
# Intervals accept a number with a unit suffix: "30s", "5m", "6h", "10d".
# A bare number is read as seconds.

[cache]
# Directory holding client.db and authority.db (default: platform data dir)
# data_dir = "/home/me/.local/share/podsync"

[sync]
# Remote sync server. Leave unset to sync against a local authority.
# server_url = "https://sync.example.com/api/"
poll_interval = "1m"
retry_attempts = 5

[scheduler]
# How often the staleness sweep runs
interval = "5m"

# Refresh feeds not updated for this long...
feed_refresh_after = "6h"
# ...but only if they were opened within this window
feed_active_window = "14d"

# Delete feeds not opened for this long
feed_evict_after = "30d"
# Subscribed feeds are kept regardless of age unless this is set
evict_subscribed_feeds = false

# Drop downloaded audio this long after it was last played
episode_expiry = "10d"

[queue]
# Background jobs running at once; this is what protects the directory API
concurrency = 1
min_interval = "1s"
retry_attempts = 5

[directory]
base_url = "https://api.podcastindex.org/api/1.0/"
max_results = 40
retry_attempts = 3
# Credentials may also come from PODCAST_INDEX_API_KEY / PODCAST_INDEX_API_SECRET
# api_key = ""
# api_secret = ""
"##
        .to_string()
    }
}

/// Parse an interval string like "1h", "30m", "6h", "1d".
pub fn parse_interval(s: &str) -> Result<Duration, String> {
    let s = s.trim().to_lowercase();

    let secs = if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .map(|h| h * 3600)
            .map_err(|_| format!("Invalid hours: {}", hours))
    } else if let Some(minutes) = s.strip_suffix('m') {
        minutes
            .trim()
            .parse::<u64>()
            .map(|m| m * 60)
            .map_err(|_| format!("Invalid minutes: {}", minutes))
    } else if let Some(days) = s.strip_suffix('d') {
        days.trim()
            .parse::<u64>()
            .map(|d| d * 86400)
            .map_err(|_| format!("Invalid days: {}", days))
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim()
            .parse::<u64>()
            .map_err(|_| format!("Invalid seconds: {}", secs))
    } else {
        s.parse::<u64>()
            .map_err(|_| format!("Invalid interval: {}. Use format like '1h', '30m', '1d'", s))
    }?;

    Ok(Duration::from_secs(secs))
}

/// Format an interval in the largest unit that divides it evenly.
pub fn format_interval(interval: Duration) -> String {
    let secs = interval.as_secs();
    if secs >= 86400 && secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter reading `"6h"` style strings or plain seconds.
mod interval {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_interval(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_interval(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Could not determine data directory")]
    NoDataDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
