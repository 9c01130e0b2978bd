//! Fixtures shared by unit tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::domain::{ApiEpisode, ApiFeed};
use crate::mutation::MutationRegistry;
use crate::queue::RetryPolicy;
use crate::store::Cache;
use crate::sync::{LocalAuthority, SyncEngine};

/// `secs` after a fixed reference instant.
pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
        + Duration::seconds(secs)
}

pub(crate) fn api_feed(id: &str, title: &str) -> ApiFeed {
    ApiFeed {
        id: id.to_string(),
        author: "Host".to_string(),
        title: title.to_string(),
        description: format!("About {}", title),
        url: format!("https://feeds.example.com/{}.xml", id),
        image: format!("https://img.example.com/{}.png", id),
    }
}

pub(crate) fn api_episode(id: &str, feed_id: &str, duration: u64) -> ApiEpisode {
    ApiEpisode {
        id: id.to_string(),
        feed_id: feed_id.to_string(),
        title: format!("Episode {}", id),
        description: String::new(),
        author: "Host".to_string(),
        image: None,
        feed_image: None,
        date_published: at(0),
        duration,
        episode: None,
        enclosure_url: format!("https://cdn.example.com/{}.mp3", id),
        enclosure_type: "audio/mpeg".to_string(),
        explicit: 0,
    }
}

/// A client engine on an in-memory cache, synced against `authority`.
pub(crate) fn engine_with(authority: LocalAuthority) -> (SyncEngine, Arc<LocalAuthority>) {
    let authority = Arc::new(authority);
    let cache = Arc::new(Cache::in_memory().unwrap());
    let engine = SyncEngine::open(
        cache,
        Arc::new(MutationRegistry::standard()),
        authority.clone(),
        RetryPolicy::none(),
    )
    .unwrap();
    (engine, authority)
}
