//! Age-based classification of cached feeds and episodes.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{Episode, Feed};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// A feed not refreshed for this long is stale.
    pub refresh_after: Duration,
    /// Only feeds accessed within this window get refreshed.
    pub active_window: Duration,
    /// A feed not accessed for this long is deleted.
    pub evict_after: Duration,
    /// Media of an episode last played this long ago is evicted.
    pub episode_expiry: Duration,
    pub evict_subscribed: bool,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            refresh_after: Duration::hours(6),
            active_window: Duration::days(14),
            evict_after: Duration::days(30),
            episode_expiry: Duration::days(10),
            evict_subscribed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Fresh,
    Stale,
    Old,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    /// Never played.
    Untouched,
    Active,
    Completed,
    Expired,
}

impl StalenessPolicy {
    pub fn classify_feed(&self, feed: &Feed, now: DateTime<Utc>) -> FeedState {
        let since_access = now - feed.last_accessed_at;
        if since_access > self.evict_after && (!feed.subscribed || self.evict_subscribed) {
            return FeedState::Old;
        }
        if since_access <= self.active_window && now - feed.last_updated_at > self.refresh_after {
            return FeedState::Stale;
        }
        FeedState::Fresh
    }

    /// Age wins over completion, so a played episode past expiry counts as
    /// expired.
    pub fn classify_episode(&self, episode: &Episode, now: DateTime<Utc>) -> EpisodeState {
        match episode.last_played_at {
            Some(at) if now - at > self.episode_expiry => EpisodeState::Expired,
            _ if episode.played => EpisodeState::Completed,
            Some(_) => EpisodeState::Active,
            None => EpisodeState::Untouched,
        }
    }

    /// Work for one cycle. Episodes only need cleanup while they still
    /// have media, so settled ones drop out of later plans.
    pub fn plan(
        &self,
        feeds: &[Feed],
        episodes: &[Episode],
        media_keys: &[String],
        now: DateTime<Utc>,
    ) -> CyclePlan {
        let mut plan = CyclePlan::default();
        let stored: BTreeSet<&str> = media_keys.iter().map(String::as_str).collect();

        for feed in feeds {
            match self.classify_feed(feed, now) {
                FeedState::Stale => plan.stale_feeds.push(feed.clone()),
                FeedState::Old => plan.old_feeds.push(feed.clone()),
                FeedState::Fresh => {}
            }
        }

        for episode in episodes {
            let has_media = episode.downloaded || stored.contains(episode.id.as_str());
            if !has_media {
                continue;
            }
            match self.classify_episode(episode, now) {
                EpisodeState::Expired => plan.expired_episodes.push(episode.clone()),
                EpisodeState::Completed => plan.completed_episodes.push(episode.clone()),
                EpisodeState::Active | EpisodeState::Untouched => {}
            }
        }

        let known: BTreeSet<&str> = episodes.iter().map(|e| e.id.as_str()).collect();
        plan.orphaned_media = media_keys
            .iter()
            .filter(|key| !known.contains(key.as_str()))
            .cloned()
            .collect();

        plan
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CyclePlan {
    pub stale_feeds: Vec<Feed>,
    pub old_feeds: Vec<Feed>,
    pub expired_episodes: Vec<Episode>,
    pub completed_episodes: Vec<Episode>,
    /// Blob keys with no matching episode.
    pub orphaned_media: Vec<String>,
}

impl CyclePlan {
    pub fn is_empty(&self) -> bool {
        self.stale_feeds.is_empty()
            && self.old_feeds.is_empty()
            && self.expired_episodes.is_empty()
            && self.completed_episodes.is_empty()
            && self.orphaned_media.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{api_episode, api_feed, at};

    fn feed(accessed_days_ago: i64, updated_hours_ago: i64, now: DateTime<Utc>) -> Feed {
        let mut feed = Feed::from_api(api_feed("f1", "Syntax"), false, now);
        feed.last_accessed_at = now - Duration::days(accessed_days_ago);
        feed.last_updated_at = now - Duration::hours(updated_hours_ago);
        feed
    }

    #[test]
    fn test_recently_accessed_outdated_feed_is_stale() {
        let now = at(0);
        let policy = StalenessPolicy::default();
        assert_eq!(policy.classify_feed(&feed(11, 7, now), now), FeedState::Stale);
        assert_eq!(policy.classify_feed(&feed(11, 5, now), now), FeedState::Fresh);
    }

    #[test]
    fn test_long_unaccessed_feed_is_old() {
        let now = at(0);
        let policy = StalenessPolicy::default();
        assert_eq!(policy.classify_feed(&feed(31, 7, now), now), FeedState::Old);
        // Outside the active window but not yet old: left alone.
        assert_eq!(policy.classify_feed(&feed(20, 48, now), now), FeedState::Fresh);
    }

    #[test]
    fn test_subscribed_feeds_kept_unless_configured() {
        let now = at(0);
        let mut old = feed(31, 7, now);
        old.subscribed = true;

        assert_eq!(
            StalenessPolicy::default().classify_feed(&old, now),
            FeedState::Fresh
        );
        let policy = StalenessPolicy {
            evict_subscribed: true,
            ..Default::default()
        };
        assert_eq!(policy.classify_feed(&old, now), FeedState::Old);
    }

    #[test]
    fn test_episode_classification() {
        let now = at(0);
        let policy = StalenessPolicy::default();
        let mut episode = Episode::from_api(api_episode("e1", "f1", 600));
        assert_eq!(policy.classify_episode(&episode, now), EpisodeState::Untouched);

        episode.last_played_at = Some(now - Duration::days(1));
        assert_eq!(policy.classify_episode(&episode, now), EpisodeState::Active);

        episode.played = true;
        assert_eq!(policy.classify_episode(&episode, now), EpisodeState::Completed);

        episode.last_played_at = Some(now - Duration::days(11));
        assert_eq!(policy.classify_episode(&episode, now), EpisodeState::Expired);
    }

    #[test]
    fn test_never_played_is_never_expired() {
        let now = at(0);
        let mut episode = Episode::from_api(api_episode("e1", "f1", 600));
        episode.date_published = now - Duration::days(400);
        episode.downloaded = true;
        let plan = StalenessPolicy::default().plan(&[], &[episode], &["e1".into()], now);
        assert!(plan.expired_episodes.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_finds_orphans_and_skips_settled_episodes() {
        let now = at(0);
        let mut expired = Episode::from_api(api_episode("e1", "f1", 600));
        expired.last_played_at = Some(now - Duration::days(11));
        let mut settled = expired.clone();
        settled.id = "e2".into();

        let plan = StalenessPolicy::default().plan(
            &[],
            &[expired, settled],
            &["e1".into(), "ghost".into()],
            now,
        );
        assert_eq!(plan.expired_episodes.len(), 1);
        assert_eq!(plan.expired_episodes[0].id, "e1");
        assert_eq!(plan.orphaned_media, vec!["ghost".to_string()]);
    }
}
