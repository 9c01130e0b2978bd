//! Wire records from the PodcastIndex API and their conversion into
//! domain records.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

use crate::app::{PodsyncError, Result};
use crate::domain::{ApiEpisode, ApiFeed};

/// Ids arrive as numbers from most endpoints and as strings from a few.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    pub fn into_string(self) -> String {
        match self {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s,
        }
    }
}

/// `status` is the string `"true"` on most endpoints and a bool on others.
fn deserialize_status<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Status {
        Bool(bool),
        Text(String),
    }
    Ok(match Option::<Status>::deserialize(deserializer)? {
        Some(Status::Bool(b)) => b,
        Some(Status::Text(s)) => s.eq_ignore_ascii_case("true"),
        None => false,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn clean(text: &str) -> String {
    html_escape::decode_html_entities(text.trim()).into_owned()
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFeed {
    pub id: RawId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub image: String,
    #[serde(default)]
    pub artwork: Option<String>,
}

impl From<RawFeed> for ApiFeed {
    fn from(raw: RawFeed) -> Self {
        let image = if raw.image.trim().is_empty() {
            non_empty(raw.artwork).unwrap_or_default()
        } else {
            raw.image.trim().to_string()
        };
        ApiFeed {
            id: raw.id.into_string(),
            author: clean(&raw.author),
            title: clean(&raw.title),
            description: clean(&raw.description),
            url: raw.url.trim().to_string(),
            image,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEpisode {
    pub id: RawId,
    pub feed_id: RawId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub feed_image: Option<String>,
    /// Unix seconds.
    #[serde(default, deserialize_with = "null_as_default")]
    pub date_published: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub duration: u64,
    #[serde(default)]
    pub episode: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub enclosure_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub enclosure_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub explicit: u8,
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl From<RawEpisode> for ApiEpisode {
    fn from(raw: RawEpisode) -> Self {
        ApiEpisode {
            id: raw.id.into_string(),
            feed_id: raw.feed_id.into_string(),
            title: clean(&raw.title),
            description: clean(&raw.description),
            author: clean(&raw.author),
            image: non_empty(raw.image),
            feed_image: non_empty(raw.feed_image),
            date_published: from_unix(raw.date_published),
            duration: raw.duration,
            episode: raw.episode,
            enclosure_url: raw.enclosure_url.trim().to_string(),
            enclosure_type: raw.enclosure_type.trim().to_string(),
            explicit: raw.explicit,
        }
    }
}

/// Common envelope of every response.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    /// The body, or a directory error if the service reported failure.
    pub fn into_body(self) -> Result<T> {
        if self.status {
            Ok(self.body)
        } else {
            Err(PodsyncError::Directory(
                self.description
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedsBody {
    #[serde(default)]
    pub feeds: Vec<RawFeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedBody {
    pub feed: RawFeed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodesBody {
    #[serde(default)]
    pub items: Vec<RawEpisode>,
}
