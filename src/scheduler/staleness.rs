//! Periodic staleness sweep.
//!
//! Each cycle scans the cache and media store, classifies what it found,
//! does the cheap cleanup inline and hands feed refreshes and deletions to
//! the task queue, then waits for the queue to drain. Cycles never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::{PodsyncError, Result};
use crate::directory::Directory;
use crate::domain::{Episode, EpisodeUpdate, FeedUpdate};
use crate::media::MediaStore;
use crate::mutation::queries;
use crate::queue::{RetryPolicy, TaskHandle, TaskQueue};
use crate::scheduler::policy::{CyclePlan, StalenessPolicy};
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Scanning,
    Classifying,
    Enqueuing,
    AwaitingQueueDrain,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Another cycle was already running.
    pub skipped: bool,
    pub refreshed: usize,
    pub refresh_failed: usize,
    pub deleted_feeds: usize,
    pub evicted_media: usize,
    pub orphans_removed: usize,
    pub errors: usize,
}

enum JobOutcome {
    Refreshed,
    Deleted,
}

pub struct StalenessScheduler {
    engine: Arc<SyncEngine>,
    directory: Arc<dyn Directory>,
    media: Arc<dyn MediaStore>,
    queue: TaskQueue,
    retry: RetryPolicy,
    policy: StalenessPolicy,
    phase: watch::Sender<CyclePhase>,
    busy: AtomicBool,
}

/// Clears the re-entrancy flag and returns to `Idle` however the cycle ends.
struct CycleGuard<'a> {
    scheduler: &'a StalenessScheduler,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.set_phase(CyclePhase::Idle);
        self.scheduler.busy.store(false, Ordering::SeqCst);
    }
}

impl StalenessScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        directory: Arc<dyn Directory>,
        media: Arc<dyn MediaStore>,
        queue: TaskQueue,
        retry: RetryPolicy,
        policy: StalenessPolicy,
    ) -> Self {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        Self {
            engine,
            directory,
            media,
            queue,
            retry,
            policy,
            phase,
            busy: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    pub fn phase(&self) -> watch::Receiver<CyclePhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: CyclePhase) {
        debug!(?phase, "Scheduler phase");
        self.phase.send_replace(phase);
    }

    /// Run one sweep against the state as of `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("Sweep already running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = CycleGuard { scheduler: self };

        self.set_phase(CyclePhase::Scanning);
        let (feeds, episodes) = self.engine.query(|tx| {
            Ok((queries::list_all_feeds(tx)?, queries::list_all_episodes(tx)?))
        })?;
        let media_keys = self.media.keys().await?;

        self.set_phase(CyclePhase::Classifying);
        let plan = self.policy.plan(&feeds, &episodes, &media_keys, now);
        info!(
            feeds = feeds.len(),
            episodes = episodes.len(),
            stale = plan.stale_feeds.len(),
            old = plan.old_feeds.len(),
            expired = plan.expired_episodes.len(),
            completed = plan.completed_episodes.len(),
            orphaned = plan.orphaned_media.len(),
            "Sweep classified cache"
        );

        self.set_phase(CyclePhase::Enqueuing);
        let mut report = CycleReport::default();
        self.evict_media(&plan, &mut report).await;
        let jobs = self.enqueue_jobs(plan, &episodes, now);

        self.set_phase(CyclePhase::AwaitingQueueDrain);
        for (feed_id, result) in join_all(jobs).await {
            match result {
                Ok(JobOutcome::Refreshed) => report.refreshed += 1,
                Ok(JobOutcome::Deleted) => report.deleted_feeds += 1,
                Err(e) => {
                    warn!(feed_id = %feed_id, error = %e, "Feed job failed");
                    report.refresh_failed += 1;
                }
            }
        }
        self.queue.on_empty().await;

        info!(
            refreshed = report.refreshed,
            failed = report.refresh_failed,
            deleted = report.deleted_feeds,
            evicted = report.evicted_media,
            orphans = report.orphans_removed,
            "Sweep complete"
        );
        Ok(report)
    }

    async fn evict_media(&self, plan: &CyclePlan, report: &mut CycleReport) {
        let finished = plan
            .expired_episodes
            .iter()
            .chain(plan.completed_episodes.iter());
        for episode in finished {
            match self.evict_episode_media(episode).await {
                Ok(()) => report.evicted_media += 1,
                Err(e) => {
                    warn!(episode_id = %episode.id, error = %e, "Media eviction failed");
                    report.errors += 1;
                }
            }
        }

        for key in &plan.orphaned_media {
            match self.media.delete(key).await {
                Ok(_) => report.orphans_removed += 1,
                Err(e) => {
                    warn!(episode_id = %key, error = %e, "Orphan removal failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn evict_episode_media(&self, episode: &Episode) -> Result<()> {
        self.media.delete(&episode.id).await?;
        if episode.downloaded {
            let mut update = EpisodeUpdate::new(&episode.id);
            update.downloaded = Some(false);
            self.engine.mutate().update_episode(update)?;
        }
        debug!(episode_id = %episode.id, "Evicted media");
        Ok(())
    }

    fn enqueue_jobs(
        &self,
        plan: CyclePlan,
        episodes: &[Episode],
        now: DateTime<Utc>,
    ) -> Vec<impl std::future::Future<Output = (String, Result<JobOutcome>)>> {
        let mut handles: Vec<(String, TaskHandle<JobOutcome>)> = Vec::new();

        for feed in plan.old_feeds {
            let owned: Vec<String> = episodes
                .iter()
                .filter(|e| e.feed_id == feed.id)
                .map(|e| e.id.clone())
                .collect();
            let engine = self.engine.clone();
            let media = self.media.clone();
            let feed_id = feed.id.clone();
            let handle = self.queue.add(async move {
                engine.mutate().delete_feed(&feed_id)?;
                engine.mutate().delete_episodes_for_feed(&feed_id)?;
                for episode_id in &owned {
                    media.delete(episode_id).await?;
                }
                info!(feed_id = %feed_id, episodes = owned.len(), "Deleted old feed");
                Ok(JobOutcome::Deleted)
            });
            handles.push((feed.id, handle));
        }

        for feed in plan.stale_feeds {
            let engine = self.engine.clone();
            let directory = self.directory.clone();
            let retry = self.retry.clone();
            let feed_id = feed.id.clone();
            let handle = self.queue.add(async move {
                let label = format!("refresh {}", feed_id);
                let (api_feed, api_episodes) = retry
                    .run(&label, || {
                        let directory = directory.clone();
                        let feed_id = feed_id.clone();
                        async move {
                            let api_feed = directory.podcast_by_id(&feed_id).await?;
                            let api_episodes = directory.episodes_by_podcast_id(&feed_id).await?;
                            Ok((api_feed, api_episodes))
                        }
                    })
                    .await?;

                let still_cached = engine.query(|tx| queries::get_feed(tx, &feed_id))?;
                if still_cached.is_none() {
                    return Err(PodsyncError::FeedNotFound(feed_id));
                }

                let mut update = FeedUpdate::from_refresh(api_feed, now);
                update.id = feed_id.clone();
                engine.mutate().update_feed(update)?;
                let count = api_episodes.len();
                let api_episodes = api_episodes
                    .into_iter()
                    .map(|mut e| {
                        e.feed_id = feed_id.clone();
                        e
                    })
                    .collect();
                engine.mutate().add_episodes_for_feed(api_episodes)?;
                info!(feed_id = %feed_id, episodes = count, "Refreshed feed");
                Ok(JobOutcome::Refreshed)
            });
            handles.push((feed.id, handle));
        }

        handles
            .into_iter()
            .map(|(feed_id, handle)| async move { (feed_id, handle.await) })
            .collect()
    }

    /// Sweep now and then every `interval` until `shutdown` flips to true.
    /// The next sweep is timed from the end of the previous one.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Staleness scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        warn!(error = %e, "Sweep failed");
                    }
                    ticker.reset();
                }
            }
        }

        info!("Staleness scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiEpisode, ApiFeed};
    use crate::media::{MediaBlob, MemoryMediaStore};
    use crate::sync::LocalAuthority;
    use crate::test_support::{api_episode, api_feed, engine_with};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct StubDirectory {
        lookups: AtomicUsize,
        missing: BTreeSet<String>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl Directory for StubDirectory {
        async fn search_by_term(&self, _query: &str) -> Result<Vec<ApiFeed>> {
            Ok(vec![])
        }

        async fn trending(&self) -> Result<Vec<ApiFeed>> {
            Ok(vec![])
        }

        async fn podcast_by_id(&self, feed_id: &str) -> Result<ApiFeed> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.map_err(|_| PodsyncError::Closed)?;
            }
            if self.missing.contains(feed_id) {
                return Err(PodsyncError::FeedNotFound(feed_id.to_string()));
            }
            Ok(api_feed(feed_id, "Refreshed"))
        }

        async fn episodes_by_podcast_id(&self, feed_id: &str) -> Result<Vec<ApiEpisode>> {
            Ok(vec![api_episode(&format!("{}-new", feed_id), feed_id, 60)])
        }
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        media: Arc<MemoryMediaStore>,
        directory: Arc<StubDirectory>,
        scheduler: Arc<StalenessScheduler>,
    }

    fn fixture(directory: StubDirectory) -> Fixture {
        let (engine, _authority) = engine_with(LocalAuthority::in_memory().unwrap());
        let engine = Arc::new(engine);
        let media = Arc::new(MemoryMediaStore::new());
        let directory = Arc::new(directory);
        let scheduler = Arc::new(StalenessScheduler::new(
            engine.clone(),
            directory.clone(),
            media.clone(),
            TaskQueue::new(1),
            RetryPolicy::none(),
            StalenessPolicy::default(),
        ));
        Fixture {
            engine,
            media,
            directory,
            scheduler,
        }
    }

    fn add_aged_feed(engine: &SyncEngine, id: &str, accessed_days: i64, updated_hours: i64) {
        let now = Utc::now();
        engine.mutate().add_feed(api_feed(id, id), false).unwrap();
        let mut update = FeedUpdate::new(id);
        update.last_accessed_at = Some(now - ChronoDuration::days(accessed_days));
        update.last_updated_at = Some(now - ChronoDuration::hours(updated_hours));
        engine.mutate().update_feed(update).unwrap();
    }

    #[tokio::test]
    async fn test_stale_feed_refreshed_once() {
        let f = fixture(StubDirectory::default());
        add_aged_feed(&f.engine, "f1", 11, 7);
        let now = Utc::now();

        let report = f.scheduler.run_cycle(now).await.unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.deleted_feeds, 0);
        assert_eq!(f.directory.lookups.load(Ordering::SeqCst), 1);

        let feed = f
            .engine
            .query(|tx| queries::get_feed(tx, "f1"))
            .unwrap()
            .unwrap();
        assert_eq!(feed.title, "Refreshed");
        assert_eq!(feed.last_updated_at, now);
        let episodes = f
            .engine
            .query(|tx| queries::list_episodes_for_feed(tx, "f1"))
            .unwrap();
        assert_eq!(episodes.len(), 1);

        let again = f.scheduler.run_cycle(now).await.unwrap();
        assert_eq!(again.refreshed, 0);
        assert_eq!(f.directory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_old_feed_deleted_not_refreshed() {
        let f = fixture(StubDirectory::default());
        add_aged_feed(&f.engine, "f1", 31, 7);
        f.engine
            .mutate()
            .add_episodes_for_feed(vec![api_episode("e1", "f1", 60)])
            .unwrap();
        f.media
            .put("e1", MediaBlob::new("audio/mpeg", vec![1, 2, 3]))
            .await
            .unwrap();

        let report = f.scheduler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.deleted_feeds, 1);
        assert_eq!(report.refreshed, 0);
        assert_eq!(f.directory.lookups.load(Ordering::SeqCst), 0);

        f.engine
            .query(|tx| {
                assert!(queries::get_feed(tx, "f1")?.is_none());
                assert!(queries::get_episode_by_id(tx, "e1")?.is_none());
                Ok(())
            })
            .unwrap();
        assert!(f.media.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_episode_media_evicted() {
        let f = fixture(StubDirectory::default());
        f.engine
            .mutate()
            .add_episodes_for_feed(vec![api_episode("e1", "f1", 60), api_episode("e2", "f1", 60)])
            .unwrap();
        for id in ["e1", "e2"] {
            let mut update = EpisodeUpdate::new(id);
            update.downloaded = Some(true);
            f.engine.mutate().update_episode(update).unwrap();
            f.media
                .put(id, MediaBlob::new("audio/mpeg", vec![0]))
                .await
                .unwrap();
        }
        let mut old = EpisodeUpdate::new("e1");
        old.last_played_at = Some(Utc::now() - ChronoDuration::days(11));
        f.engine.mutate().update_episode(old).unwrap();

        let report = f.scheduler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.evicted_media, 1);

        assert_eq!(f.media.keys().await.unwrap(), vec!["e2".to_string()]);
        let (e1, e2) = f
            .engine
            .query(|tx| {
                Ok((
                    queries::get_episode_by_id(tx, "e1")?.unwrap(),
                    queries::get_episode_by_id(tx, "e2")?.unwrap(),
                ))
            })
            .unwrap();
        assert!(!e1.downloaded);
        assert!(e2.downloaded);
    }

    #[tokio::test]
    async fn test_completed_and_orphaned_media_removed() {
        let f = fixture(StubDirectory::default());
        f.engine
            .mutate()
            .add_episodes_for_feed(vec![api_episode("e1", "f1", 60)])
            .unwrap();
        f.engine
            .mutate()
            .update_progress_for_episode("e1", 60.0, Some(true))
            .unwrap();
        f.media
            .put("e1", MediaBlob::new("audio/mpeg", vec![0]))
            .await
            .unwrap();
        f.media
            .put("gone", MediaBlob::new("audio/mpeg", vec![0]))
            .await
            .unwrap();

        let report = f.scheduler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.evicted_media, 1);
        assert_eq!(report.orphans_removed, 1);
        assert!(f.media.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_abort_cycle() {
        let f = fixture(StubDirectory {
            missing: BTreeSet::from(["f1".to_string()]),
            ..Default::default()
        });
        add_aged_feed(&f.engine, "f1", 1, 7);
        add_aged_feed(&f.engine, "f2", 1, 7);

        let report = f.scheduler.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.refresh_failed, 1);
        assert_eq!(report.refreshed, 1);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(StubDirectory {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        add_aged_feed(&f.engine, "f1", 1, 7);

        let mut phase = f.scheduler.phase();
        let scheduler = f.scheduler.clone();
        let first = tokio::spawn(async move { scheduler.run_cycle(Utc::now()).await });
        phase
            .wait_for(|p| *p == CyclePhase::AwaitingQueueDrain)
            .await
            .unwrap();

        let second = f.scheduler.run_cycle(Utc::now()).await.unwrap();
        assert!(second.skipped);

        gate.add_permits(1);
        let first = first.await.unwrap().unwrap();
        assert!(!first.skipped);
        assert_eq!(first.refreshed, 1);
        assert_eq!(*f.scheduler.phase().borrow(), CyclePhase::Idle);
    }
}
