//! Built-in mutators.
//!
//! Each one is a read-merge-write over the entities it touches: look up the
//! current value (or its absence), compute the next value, write it back.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::app::{PodsyncError, Result};
use crate::domain::{keys, ApiEpisode, ApiFeed, Episode, EpisodeUpdate, Feed, FeedUpdate};
use crate::mutation::{MutationContext, MutationRegistry};
use crate::store::{Reader, WriteTransaction};

/// Wire names of the built-in mutators.
pub mod names {
    pub const ADD_FEED: &str = "addFeed";
    pub const ADD_FEEDS: &str = "addFeeds";
    pub const UPDATE_FEED: &str = "updateFeed";
    pub const UPDATE_FEED_LAST_ACCESSED_AT: &str = "updateFeedLastAccessedAt";
    pub const DELETE_FEED: &str = "deleteFeed";
    pub const SUBSCRIBE_TO_FEED: &str = "subscribeToFeed";
    pub const UNSUBSCRIBE_FROM_FEED: &str = "unsubscribeFromFeed";
    pub const ADD_EPISODES_FOR_FEED: &str = "addEpisodesForFeed";
    pub const DELETE_EPISODES_FOR_FEED: &str = "deleteEpisodesForFeed";
    pub const UPDATE_EPISODE: &str = "updateEpisode";
    pub const UPDATE_PROGRESS_FOR_EPISODE: &str = "updateProgressForEpisode";
    pub const SET_CURRENT_EPISODE: &str = "setCurrentEpisode";
    pub const SET_PLAYER_SPEED: &str = "setPlayerSpeed";
    pub const SET_AUDIO_VOLUME: &str = "setAudioVolume";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFeedArgs {
    pub feed: ApiFeed,
    #[serde(default)]
    pub from_search: bool,
}

/// The directory sometimes hands back feeds as JSON-encoded strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedArg {
    Record(ApiFeed),
    Encoded(String),
}

impl FeedArg {
    fn decode(self) -> Result<ApiFeed> {
        match self {
            FeedArg::Record(feed) => Ok(feed),
            FeedArg::Encoded(raw) => {
                serde_json::from_str(&raw).map_err(|e| PodsyncError::InvalidArgs {
                    name: names::ADD_FEEDS.to_string(),
                    reason: format!("encoded feed: {}", e),
                })
            }
        }
    }
}

impl From<ApiFeed> for FeedArg {
    fn from(feed: ApiFeed) -> Self {
        FeedArg::Record(feed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFeedsArgs {
    pub feeds: Vec<FeedArg>,
    #[serde(default)]
    pub from_search: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressArgs {
    pub id: String,
    /// Position in seconds.
    pub progress: f64,
    /// Left unchanged when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played: Option<bool>,
}

pub fn register_all(registry: &mut MutationRegistry) {
    let registrations: [Result<()>; 14] = [
        registry.register_fn(names::ADD_FEED, add_feed),
        registry.register_fn(names::ADD_FEEDS, add_feeds),
        registry.register_fn(names::UPDATE_FEED, update_feed),
        registry.register_fn(names::UPDATE_FEED_LAST_ACCESSED_AT, update_feed_last_accessed_at),
        registry.register_fn(names::DELETE_FEED, delete_feed),
        registry.register_fn(names::SUBSCRIBE_TO_FEED, subscribe_to_feed),
        registry.register_fn(names::UNSUBSCRIBE_FROM_FEED, unsubscribe_from_feed),
        registry.register_fn(names::ADD_EPISODES_FOR_FEED, add_episodes_for_feed),
        registry.register_fn(names::DELETE_EPISODES_FOR_FEED, delete_episodes_for_feed),
        registry.register_fn(names::UPDATE_EPISODE, update_episode),
        registry.register_fn(names::UPDATE_PROGRESS_FOR_EPISODE, update_progress_for_episode),
        registry.register_fn(names::SET_CURRENT_EPISODE, set_current_episode),
        registry.register_fn(names::SET_PLAYER_SPEED, set_player_speed),
        registry.register_fn(names::SET_AUDIO_VOLUME, set_audio_volume),
    ];
    for result in registrations {
        if let Err(e) = result {
            warn!(error = %e, "Skipping built-in mutator");
        }
    }
}

fn store_feed(tx: &mut WriteTransaction, ctx: &MutationContext, api: ApiFeed, from_search: bool) -> Result<()> {
    let key = keys::feed(&api.id);
    tx.update::<Feed, _>(&key, |existing| {
        Ok(Some(match existing {
            Some(mut feed) => {
                // A feed the user added directly stays regular even if it
                // later shows up in search results.
                feed.from_search = feed.from_search && from_search;
                feed.merge_api(api)
            }
            None => Feed::from_api(api, from_search, ctx.now),
        }))
    })
}

pub fn add_feed(tx: &mut WriteTransaction, ctx: &MutationContext, args: AddFeedArgs) -> Result<()> {
    debug!(feed_id = %args.feed.id, from_search = args.from_search, "Storing feed");
    store_feed(tx, ctx, args.feed, args.from_search)
}

pub fn add_feeds(tx: &mut WriteTransaction, ctx: &MutationContext, args: AddFeedsArgs) -> Result<()> {
    for feed in args.feeds {
        store_feed(tx, ctx, feed.decode()?, args.from_search)?;
    }
    Ok(())
}

pub fn update_feed(tx: &mut WriteTransaction, _ctx: &MutationContext, update: FeedUpdate) -> Result<()> {
    let key = keys::feed(&update.id);
    tx.update::<Feed, _>(&key, |existing| Ok(existing.map(|feed| update.apply_to(feed))))
}

pub fn update_feed_last_accessed_at(
    tx: &mut WriteTransaction,
    ctx: &MutationContext,
    feed_id: String,
) -> Result<()> {
    tx.update::<Feed, _>(&keys::feed(&feed_id), |existing| {
        Ok(existing.map(|mut feed| {
            feed.last_accessed_at = ctx.now;
            feed
        }))
    })
}

pub fn delete_feed(tx: &mut WriteTransaction, _ctx: &MutationContext, feed_id: String) -> Result<()> {
    debug!(feed_id = %feed_id, "Deleting feed");
    tx.delete(keys::feed(&feed_id));
    Ok(())
}

fn require_feed(tx: &WriteTransaction, feed_id: &str) -> Result<Feed> {
    tx.get::<Feed>(&keys::feed(feed_id))?
        .ok_or_else(|| PodsyncError::FeedNotFound(feed_id.to_string()))
}

pub fn subscribe_to_feed(tx: &mut WriteTransaction, ctx: &MutationContext, feed_id: String) -> Result<()> {
    let mut feed = require_feed(tx, &feed_id)?;
    feed.subscribed = true;
    feed.last_subscribed_at = Some(ctx.now);
    feed.last_accessed_at = ctx.now;
    tx.set(keys::feed(&feed_id), &feed)
}

pub fn unsubscribe_from_feed(
    tx: &mut WriteTransaction,
    _ctx: &MutationContext,
    feed_id: String,
) -> Result<()> {
    let mut feed = require_feed(tx, &feed_id)?;
    feed.subscribed = false;
    tx.set(keys::feed(&feed_id), &feed)
}

/// Cache key of an episode, found through its feed index.
pub(crate) fn episode_key(tx: &impl Reader, episode_id: &str) -> Result<Option<String>> {
    Ok(tx
        .get::<String>(&keys::episode_index(episode_id))?
        .map(|feed_id| keys::episode(&feed_id, episode_id)))
}

pub fn add_episodes_for_feed(
    tx: &mut WriteTransaction,
    _ctx: &MutationContext,
    episodes: Vec<ApiEpisode>,
) -> Result<()> {
    debug!(count = episodes.len(), "Storing episodes");
    for api in episodes {
        let id = api.id.clone();
        let key = keys::episode(&api.feed_id, &id);

        // An episode that moved feeds keeps its playback state.
        let mut previous = None;
        if let Some(old_key) = episode_key(&*tx, &id)? {
            if old_key != key {
                previous = tx.get::<Episode>(&old_key)?;
                tx.delete(old_key);
            }
        }

        tx.set(keys::episode_index(&id), &api.feed_id)?;
        tx.update::<Episode, _>(&key, |existing| {
            Ok(Some(match existing.or(previous) {
                Some(episode) => episode.merge_api(api),
                None => Episode::from_api(api),
            }))
        })?;
    }
    Ok(())
}

pub fn delete_episodes_for_feed(
    tx: &mut WriteTransaction,
    _ctx: &MutationContext,
    feed_id: String,
) -> Result<()> {
    let doomed = tx.scan_values(&keys::episodes_of(&feed_id));
    debug!(feed_id = %feed_id, count = doomed.len(), "Deleting episodes for feed");
    for (key, _) in doomed {
        if let Some((_, id)) = keys::parse_episode(&key) {
            tx.delete(keys::episode_index(id));
        }
        tx.delete(key);
    }
    Ok(())
}

pub fn update_episode(tx: &mut WriteTransaction, _ctx: &MutationContext, update: EpisodeUpdate) -> Result<()> {
    let Some(key) = episode_key(&*tx, &update.id)? else {
        return Ok(());
    };
    tx.update::<Episode, _>(&key, |existing| Ok(existing.map(|episode| update.apply_to(episode))))
}

pub fn update_progress_for_episode(
    tx: &mut WriteTransaction,
    ctx: &MutationContext,
    args: ProgressArgs,
) -> Result<()> {
    let Some(key) = episode_key(&*tx, &args.id)? else {
        debug!(episode_id = %args.id, "Progress for unknown episode ignored");
        return Ok(());
    };
    tx.update::<Episode, _>(&key, |existing| {
        Ok(existing.map(|mut episode| {
            episode.current_time = args.progress;
            if let Some(played) = args.played {
                episode.played = played;
            }
            episode.last_played_at = Some(ctx.now);
            episode.clamp_progress();
            episode
        }))
    })
}

pub fn set_current_episode(tx: &mut WriteTransaction, _ctx: &MutationContext, episode_id: String) -> Result<()> {
    tx.set(keys::CURRENT_EPISODE_ID, &episode_id)
}

pub fn set_player_speed(tx: &mut WriteTransaction, _ctx: &MutationContext, speed: f64) -> Result<()> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(PodsyncError::InvalidArgs {
            name: names::SET_PLAYER_SPEED.to_string(),
            reason: format!("speed must be positive, got {}", speed),
        });
    }
    tx.set(keys::PLAYER_SPEED, &speed)
}

pub fn set_audio_volume(tx: &mut WriteTransaction, _ctx: &MutationContext, volume: f64) -> Result<()> {
    if volume.is_nan() {
        return Err(PodsyncError::InvalidArgs {
            name: names::SET_AUDIO_VOLUME.to_string(),
            reason: "volume is NaN".to_string(),
        });
    }
    tx.set(keys::VOLUME, &volume.clamp(0.0, 1.0))
}
