//! Cache key layout.
//!
//! Feeds live under `feed/<id>`. Episodes are nested under their feed as
//! `episode/<feedId>/<id>` so listing a feed's episodes is a prefix scan;
//! `episode-feed/<id>` maps an episode id back to its feed for id-only
//! lookups. Settings are singleton keys starting with `/`.

pub const FEED_PREFIX: &str = "feed/";
pub const EPISODE_PREFIX: &str = "episode/";
pub const EPISODE_INDEX_PREFIX: &str = "episode-feed/";

pub const CURRENT_EPISODE_ID: &str = "/current-episode-id";
pub const PLAYER_SPEED: &str = "/player-speed";
pub const VOLUME: &str = "/volume";
pub const INIT: &str = "/init";

pub fn feed(id: &str) -> String {
    format!("{}{}", FEED_PREFIX, id)
}

pub fn episode(feed_id: &str, id: &str) -> String {
    format!("{}{}/{}", EPISODE_PREFIX, feed_id, id)
}

/// Prefix covering every episode of one feed.
pub fn episodes_of(feed_id: &str) -> String {
    format!("{}{}/", EPISODE_PREFIX, feed_id)
}

pub fn episode_index(id: &str) -> String {
    format!("{}{}", EPISODE_INDEX_PREFIX, id)
}

/// Split `episode/<feedId>/<id>` into `(feedId, id)`.
pub fn parse_episode(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(EPISODE_PREFIX)?;
    let (feed_id, id) = rest.split_once('/')?;
    if feed_id.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    Some((feed_id, id))
}
