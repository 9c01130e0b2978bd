use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A podcast as returned by the remote directory, before any local metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFeed {
    pub id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image: String,
}

/// A cached podcast plus its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image: String,
    /// Last successful refresh from the directory.
    pub last_updated_at: DateTime<Utc>,
    /// Last time the user looked at or played from this feed.
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub last_subscribed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscribed: bool,
    /// Stored only because it showed up in search results.
    #[serde(default)]
    pub from_search: bool,
}

impl Feed {
    pub fn from_api(api: ApiFeed, from_search: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: api.id,
            author: api.author,
            title: api.title,
            description: api.description,
            url: api.url,
            image: api.image,
            last_updated_at: now,
            last_accessed_at: now,
            last_subscribed_at: None,
            subscribed: false,
            from_search,
        }
    }

    /// Replace directory-owned fields, keeping local metadata untouched.
    pub fn merge_api(mut self, api: ApiFeed) -> Self {
        self.author = api.author;
        self.title = api.title;
        self.description = api.description;
        self.url = api.url;
        self.image = api.image;
        self
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// Partial update for a feed. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl FeedUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Directory refresh: every directory-owned field plus the refresh time.
    pub fn from_refresh(api: ApiFeed, refreshed_at: DateTime<Utc>) -> Self {
        Self {
            id: api.id,
            author: Some(api.author),
            title: Some(api.title),
            description: Some(api.description),
            url: Some(api.url),
            image: Some(api.image),
            last_updated_at: Some(refreshed_at),
            last_accessed_at: None,
        }
    }

    pub fn apply_to(&self, mut feed: Feed) -> Feed {
        if let Some(ref author) = self.author {
            feed.author = author.clone();
        }
        if let Some(ref title) = self.title {
            feed.title = title.clone();
        }
        if let Some(ref description) = self.description {
            feed.description = description.clone();
        }
        if let Some(ref url) = self.url {
            feed.url = url.clone();
        }
        if let Some(ref image) = self.image {
            feed.image = image.clone();
        }
        if let Some(at) = self.last_updated_at {
            feed.last_updated_at = at;
        }
        if let Some(at) = self.last_accessed_at {
            feed.last_accessed_at = at;
        }
        feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_feed() -> ApiFeed {
        ApiFeed {
            id: "920666".into(),
            author: "Jane".into(),
            title: "Rust Radio".into(),
            description: "All about Rust".into(),
            url: "https://example.com/rss".into(),
            image: "https://example.com/cover.png".into(),
        }
    }

    #[test]
    fn test_from_api_sets_freshness() {
        let now = Utc::now();
        let feed = Feed::from_api(api_feed(), true, now);
        assert_eq!(feed.last_updated_at, now);
        assert_eq!(feed.last_accessed_at, now);
        assert!(feed.from_search);
        assert!(!feed.subscribed);
        assert_eq!(feed.last_subscribed_at, None);
    }

    #[test]
    fn test_merge_api_keeps_local_metadata() {
        let then = Utc::now() - chrono::Duration::days(3);
        let mut feed = Feed::from_api(api_feed(), false, then);
        feed.subscribed = true;

        let mut renamed = api_feed();
        renamed.title = "Rust Radio (new)".into();
        let merged = feed.merge_api(renamed);

        assert_eq!(merged.title, "Rust Radio (new)");
        assert!(merged.subscribed);
        assert_eq!(merged.last_updated_at, then);
    }

    #[test]
    fn test_update_partial() {
        let feed = Feed::from_api(api_feed(), false, Utc::now());
        let update = FeedUpdate {
            title: Some("Renamed".into()),
            ..FeedUpdate::new("920666")
        };
        let updated = update.apply_to(feed.clone());
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.description, feed.description);
    }

    #[test]
    fn test_display_title_falls_back_to_id() {
        let mut api = api_feed();
        api.title = String::new();
        let feed = Feed::from_api(api, false, Utc::now());
        assert_eq!(feed.display_title(), "920666");
    }

    #[test]
    fn test_serialized_field_names() {
        let feed = Feed::from_api(api_feed(), false, Utc::now());
        let value = serde_json::to_value(&feed).unwrap();
        assert!(value.get("lastUpdatedAt").is_some());
        assert!(value.get("fromSearch").is_some());
    }
}
