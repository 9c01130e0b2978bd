use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An episode as returned by the remote directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEpisode {
    pub id: String,
    pub feed_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub feed_image: Option<String>,
    pub date_published: DateTime<Utc>,
    /// Length in seconds; 0 when the directory does not know.
    #[serde(default)]
    pub duration: u64,
    /// Episode number within the feed, e.g. 605.
    #[serde(default)]
    pub episode: Option<i64>,
    #[serde(default)]
    pub enclosure_url: String,
    #[serde(default)]
    pub enclosure_type: String,
    /// Directory encodes this as 0 or 1.
    #[serde(default)]
    pub explicit: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub feed_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub image: Option<String>,
    pub date_published: DateTime<Utc>,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub duration_formatted: String,
    #[serde(default)]
    pub episode: Option<i64>,
    #[serde(default)]
    pub enclosure_url: String,
    #[serde(default)]
    pub enclosure_type: String,
    #[serde(default)]
    pub explicit: bool,

    /// Resume position in seconds.
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub last_played_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub played: bool,
    #[serde(default)]
    pub downloaded: bool,
}

impl Episode {
    pub fn from_api(api: ApiEpisode) -> Self {
        let mut episode = Self {
            id: api.id.clone(),
            feed_id: api.feed_id.clone(),
            title: String::new(),
            description: String::new(),
            author: String::new(),
            image: None,
            date_published: api.date_published,
            duration: 0,
            duration_formatted: String::new(),
            episode: None,
            enclosure_url: String::new(),
            enclosure_type: String::new(),
            explicit: false,
            current_time: 0.0,
            last_played_at: None,
            played: false,
            downloaded: false,
        };
        episode = episode.merge_api(api);
        episode
    }

    /// Take directory-owned fields from `api`, keeping playback state.
    pub fn merge_api(mut self, api: ApiEpisode) -> Self {
        self.feed_id = api.feed_id;
        self.title = api.title;
        self.description = api.description;
        self.author = api.author;
        self.image = api.image.or(api.feed_image);
        self.date_published = api.date_published;
        self.duration = api.duration;
        self.duration_formatted = format_duration(api.duration);
        self.episode = api.episode;
        self.enclosure_url = api.enclosure_url;
        self.enclosure_type = api.enclosure_type;
        self.explicit = api.explicit == 1;
        self.clamp_progress();
        self
    }

    /// Keep `current_time` within `[0, duration]`. A zero duration means
    /// unknown and does not bound the position.
    pub fn clamp_progress(&mut self) {
        if self.current_time < 0.0 || self.current_time.is_nan() {
            self.current_time = 0.0;
        }
        if self.duration > 0 {
            self.current_time = self.current_time.min(self.duration as f64);
        }
    }

    pub fn is_video(&self) -> bool {
        self.enclosure_type.starts_with("video/")
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            "(Untitled)"
        } else {
            &self.title
        }
    }
}

/// Partial update for an episode. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<bool>,
}

impl EpisodeUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, mut episode: Episode) -> Episode {
        if let Some(ref title) = self.title {
            episode.title = title.clone();
        }
        if let Some(ref description) = self.description {
            episode.description = description.clone();
        }
        if let Some(ref image) = self.image {
            episode.image = Some(image.clone());
        }
        if let Some(current_time) = self.current_time {
            episode.current_time = current_time;
        }
        if let Some(at) = self.last_played_at {
            episode.last_played_at = Some(at);
        }
        if let Some(played) = self.played {
            episode.played = played;
        }
        if let Some(downloaded) = self.downloaded {
            episode.downloaded = downloaded;
        }
        episode.clamp_progress();
        episode
    }
}

/// Render seconds as `mm:ss`, or `h:mm:ss` once an hour is reached.
pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours == 0 {
        format!("{:02}:{:02}", minutes, seconds)
    } else {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    }
}
