//! Read-side helpers over any [`Reader`], usable inside subscriptions,
//! one-shot queries and mutators alike. List results come back in key
//! order unless stated otherwise.

use chrono::{DateTime, Utc};

use crate::app::Result;
use crate::domain::{keys, Episode, Feed};
use crate::mutation::mutators::episode_key;
use crate::scheduler::policy::{EpisodeState, FeedState, StalenessPolicy};
use crate::store::Reader;

pub fn list_all_feeds(r: &impl Reader) -> Result<Vec<Feed>> {
    r.scan(keys::FEED_PREFIX)
}

/// Feeds the user added directly rather than through search.
pub fn list_regular_feeds(r: &impl Reader) -> Result<Vec<Feed>> {
    Ok(list_all_feeds(r)?
        .into_iter()
        .filter(|feed| !feed.from_search)
        .collect())
}

pub fn list_searched_feeds(r: &impl Reader) -> Result<Vec<Feed>> {
    Ok(list_all_feeds(r)?
        .into_iter()
        .filter(|feed| feed.from_search)
        .collect())
}

pub fn list_subscribed_feeds(r: &impl Reader) -> Result<Vec<Feed>> {
    Ok(list_all_feeds(r)?
        .into_iter()
        .filter(|feed| feed.subscribed)
        .collect())
}

pub fn get_feed(r: &impl Reader, feed_id: &str) -> Result<Option<Feed>> {
    r.get(&keys::feed(feed_id))
}

/// Newest first.
pub fn list_episodes_for_feed(r: &impl Reader, feed_id: &str) -> Result<Vec<Episode>> {
    let mut episodes: Vec<Episode> = r.scan(&keys::episodes_of(feed_id))?;
    episodes.sort_by(|a, b| b.date_published.cmp(&a.date_published));
    Ok(episodes)
}

pub fn list_all_episodes(r: &impl Reader) -> Result<Vec<Episode>> {
    r.scan(keys::EPISODE_PREFIX)
}

pub fn get_episode_by_id(r: &impl Reader, episode_id: &str) -> Result<Option<Episode>> {
    match episode_key(r, episode_id)? {
        Some(key) => r.get(&key),
        None => Ok(None),
    }
}

pub fn get_current_episode_id(r: &impl Reader) -> Result<Option<String>> {
    r.get(keys::CURRENT_EPISODE_ID)
}

pub fn get_current_episode(r: &impl Reader) -> Result<Option<Episode>> {
    match get_current_episode_id(r)? {
        Some(id) => get_episode_by_id(r, &id),
        None => Ok(None),
    }
}

pub fn get_player_speed(r: &impl Reader) -> Result<f64> {
    Ok(r.get(keys::PLAYER_SPEED)?.unwrap_or(1.0))
}

pub fn get_volume(r: &impl Reader) -> Result<f64> {
    Ok(r.get(keys::VOLUME)?.unwrap_or(1.0))
}

pub fn list_stale_feeds(
    r: &impl Reader,
    policy: &StalenessPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<Feed>> {
    Ok(list_all_feeds(r)?
        .into_iter()
        .filter(|feed| policy.classify_feed(feed, now) == FeedState::Stale)
        .collect())
}

pub fn list_old_feeds(
    r: &impl Reader,
    policy: &StalenessPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<Feed>> {
    Ok(list_all_feeds(r)?
        .into_iter()
        .filter(|feed| policy.classify_feed(feed, now) == FeedState::Old)
        .collect())
}

pub fn list_expired_episodes(
    r: &impl Reader,
    policy: &StalenessPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<Episode>> {
    Ok(list_all_episodes(r)?
        .into_iter()
        .filter(|episode| policy.classify_episode(episode, now) == EpisodeState::Expired)
        .collect())
}
