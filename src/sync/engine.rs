//! Client side of the sync protocol.
//!
//! Lifecycle:
//! 1. `call` applies a mutation in a cache write transaction and appends it
//!    to the outbox in the same durable commit.
//! 2. `push` sends the whole outbox; the authority ignores ids it has seen.
//! 3. `pull` fetches the authoritative patch and reconciles: new base is the
//!    old base plus the patch, acknowledged mutations leave the outbox, the
//!    rest are replayed on top, and keys the authority wrote are laid over
//!    the result so the authority wins where both touched the same key.
//!
//! An authoritative write pins its key to the base value until every
//! mutation that was pending when it arrived has been acknowledged. Later
//! pulls that do not mention the key keep it pinned, and mutations made
//! after the pin still apply on top of it.
//!
//! Reconciliation holds the cache writer, so no optimistic apply can run in
//! the middle of it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

use crate::app::error::lock;
use crate::app::{PodsyncError, Result};
use crate::domain::{ApiEpisode, ApiFeed, EpisodeUpdate, FeedUpdate, PendingMutation};
use crate::mutation::mutators::{names, AddFeedArgs, AddFeedsArgs, FeedArg, ProgressArgs};
use crate::mutation::{MutationContext, MutationRegistry};
use crate::queue::RetryPolicy;
use crate::store::{diff, Batch, Cache, Commit, Entries, ReadTransaction, WriteTransaction};
use crate::sync::{apply_patch, PatchOp, PullRequest, PullResponse, PushRequest, SyncChannel};

const CLIENT_ID_KEY: &str = "client_id";
const COOKIE_KEY: &str = "cookie";
const LAST_ACKED_KEY: &str = "last_mutation_id";
const PINNED_KEY: &str = "pinned_keys";

struct SyncState {
    outbox: VecDeque<PendingMutation>,
    next_id: u64,
    base: Arc<Entries>,
    cookie: Option<u64>,
    last_acked: u64,
    /// Keys overwritten by the authority, with the newest mutation id that
    /// was pending at the time.
    pinned: BTreeMap<String, u64>,
    last_error: Option<String>,
    last_pull_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub client_id: String,
    pub pending: usize,
    pub cookie: Option<u64>,
    pub last_mutation_id: u64,
    pub last_error: Option<String>,
    pub last_pull_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub pushed: usize,
    pub acknowledged: usize,
    pub changed: BTreeSet<String>,
}

pub struct SyncEngine {
    client_id: String,
    cache: Arc<Cache>,
    registry: Arc<MutationRegistry>,
    channel: Arc<dyn SyncChannel>,
    retry: RetryPolicy,
    state: Mutex<SyncState>,
    push_wanted: Notify,
    poke: Notify,
}

fn generate_client_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    hex::encode(&hasher.finalize()[..8])
}

impl SyncEngine {
    /// Restore the outbox, base and cursor persisted by a previous session.
    pub fn open(
        cache: Arc<Cache>,
        registry: Arc<MutationRegistry>,
        channel: Arc<dyn SyncChannel>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let store = cache.store().clone();
        let outbox: VecDeque<PendingMutation> = store.load_outbox()?.into();
        let base = store.load_base()?;
        let cookie = store.meta(COOKIE_KEY)?.and_then(|v| v.parse().ok());
        let last_acked: u64 = store
            .meta(LAST_ACKED_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let pinned: BTreeMap<String, u64> = match store.meta(PINNED_KEY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };

        let client_id = match store.meta(CLIENT_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = generate_client_id();
                store.commit(&Batch {
                    meta: vec![(CLIENT_ID_KEY.to_string(), id.clone())],
                    ..Default::default()
                })?;
                id
            }
        };

        let next_id = outbox.back().map(|m| m.id).unwrap_or(0).max(last_acked) + 1;
        info!(
            client_id = %client_id,
            pending = outbox.len(),
            cookie = ?cookie,
            "Sync engine opened"
        );

        Ok(Self {
            client_id,
            cache,
            registry,
            channel,
            retry,
            state: Mutex::new(SyncState {
                outbox,
                next_id,
                base: Arc::new(base),
                cookie,
                last_acked,
                pinned,
                last_error: None,
                last_pull_at: None,
            }),
            push_wanted: Notify::new(),
            poke: Notify::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<MutationRegistry> {
        &self.registry
    }

    /// Apply a named mutation optimistically and queue it for the authority.
    /// A mutation that fails locally is neither committed nor queued.
    pub fn call(&self, name: &str, args: Value) -> Result<Commit> {
        let ctx = MutationContext::now();
        let mut tx = self.cache.begin_write()?;
        self.registry.apply(&mut tx, &ctx, name, &args)?;

        let mut state = lock(&self.state, "sync state")?;
        let pending = PendingMutation {
            id: state.next_id,
            name: name.to_string(),
            args,
            created_at: ctx.now,
        };
        let commit = tx.commit_with(Batch {
            outbox_push: vec![pending.clone()],
            ..Default::default()
        })?;

        debug!(mutation = name, id = pending.id, version = commit.version, "Mutation applied");
        state.next_id += 1;
        state.outbox.push_back(pending);
        drop(state);

        self.push_wanted.notify_one();
        Ok(commit)
    }

    pub fn mutate(&self) -> Mutate<'_> {
        Mutate { engine: self }
    }

    pub fn query<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        self.cache.query(f)
    }

    pub fn subscribe<T, F>(&self, query: F) -> Result<watch::Receiver<T>>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(&ReadTransaction) -> Result<T> + Send + Sync + 'static,
    {
        self.cache.subscribe(query)
    }

    pub fn pending(&self) -> Result<Vec<PendingMutation>> {
        Ok(lock(&self.state, "sync state")?.outbox.iter().cloned().collect())
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let state = lock(&self.state, "sync state")?;
        Ok(SyncStatus {
            client_id: self.client_id.clone(),
            pending: state.outbox.len(),
            cookie: state.cookie,
            last_mutation_id: state.last_acked,
            last_error: state.last_error.clone(),
            last_pull_at: state.last_pull_at,
        })
    }

    /// Ask the running loop to pull soon.
    pub fn poke(&self) {
        self.poke.notify_one();
    }

    fn record_error(&self, err: &PodsyncError) {
        if let Ok(mut state) = self.state.lock() {
            state.last_error = Some(err.to_string());
        }
    }

    /// Send every unacknowledged mutation. Returns how many were sent.
    pub async fn push(&self) -> Result<usize> {
        let mutations = self.pending()?;
        if mutations.is_empty() {
            return Ok(0);
        }
        let request = PushRequest {
            client_id: self.client_id.clone(),
            mutations,
        };

        let result = self.retry.run("push", || self.channel.push(&request)).await;
        match result {
            Ok(()) => {
                debug!(count = request.mutations.len(), "Pushed mutations");
                Ok(request.mutations.len())
            }
            Err(e) => {
                warn!(error = %e, pending = request.mutations.len(), "Push failed, outbox kept");
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Fetch and reconcile the authoritative patch. On failure the visible
    /// state stays as it was.
    pub async fn pull(&self) -> Result<SyncReport> {
        let request = PullRequest {
            client_id: self.client_id.clone(),
            cookie: lock(&self.state, "sync state")?.cookie,
        };

        let response = match self.retry.run("pull", || self.channel.pull(&request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Pull failed, serving last known state");
                self.record_error(&e);
                return Err(e);
            }
        };

        let report = self.reconcile(response)?;
        if let Ok(mut state) = self.state.lock() {
            state.last_error = None;
            state.last_pull_at = Some(Utc::now());
        }
        Ok(report)
    }

    /// Push then pull.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let pushed = self.push().await?;
        let mut report = self.pull().await?;
        report.pushed = pushed;
        Ok(report)
    }

    /// Rebuild visible state from an authoritative patch. Safe to call
    /// again with the same response.
    pub fn reconcile(&self, response: PullResponse) -> Result<SyncReport> {
        let mut tx = self.cache.begin_write()?;
        let mut state = lock(&self.state, "sync state")?;

        let resets = matches!(response.patch.first(), Some(PatchOp::Clear));
        if let Some(cookie) = state.cookie {
            if response.cookie < cookie && !resets {
                debug!(cookie = response.cookie, current = cookie, "Ignoring stale pull");
                return Ok(SyncReport::default());
            }
        }

        let mut base = (*state.base).clone();
        apply_patch(&mut base, &response.patch);
        let acked = response.last_mutation_id.max(state.last_acked);
        let acknowledged = state.outbox.iter().filter(|m| m.id <= acked).count();

        let remaining: Vec<&PendingMutation> =
            state.outbox.iter().filter(|m| m.id > acked).collect();
        let mut pinned: BTreeMap<String, u64> = state
            .pinned
            .iter()
            .filter(|(_, id)| **id > acked)
            .map(|(key, id)| (key.clone(), *id))
            .collect();
        if let Some(newest) = remaining.last().map(|m| m.id) {
            let patched = response.patch.iter().filter_map(|op| match op {
                PatchOp::Put { key, .. } | PatchOp::Del { key } => Some(key.clone()),
                PatchOp::Clear => None,
            });
            for key in patched.chain(diff(&state.base, &base).into_keys()) {
                pinned.insert(key, newest);
            }
        }

        let mut pins: Vec<(u64, &String)> = pinned.iter().map(|(key, id)| (*id, key)).collect();
        pins.sort();
        let mut pins = pins.into_iter().peekable();

        let mut replay = WriteTransaction::new(Arc::new(base.clone()));
        for mutation in remaining {
            while let Some((_, key)) = pins.next_if(|(id, _)| *id < mutation.id) {
                pin_to_base(&mut replay, &base, key);
            }
            let checkpoint = replay.checkpoint();
            let ctx = MutationContext::new(mutation.created_at);
            if let Err(e) = self
                .registry
                .apply(&mut replay, &ctx, &mutation.name, &mutation.args)
            {
                warn!(
                    mutation = %mutation.name,
                    id = mutation.id,
                    error = %e,
                    "Pending mutation no longer applies, skipping on replay"
                );
                replay.restore(checkpoint);
            }
        }
        for (_, key) in pins {
            pin_to_base(&mut replay, &base, key);
        }
        tx.reset_to(&replay.entries());

        let mut meta = vec![(COOKIE_KEY.to_string(), response.cookie.to_string())];
        if acked > state.last_acked {
            meta.push((LAST_ACKED_KEY.to_string(), acked.to_string()));
        }
        if pinned != state.pinned {
            meta.push((PINNED_KEY.to_string(), serde_json::to_string(&pinned)?));
        }
        let commit = tx.commit_with(Batch {
            base: diff(&state.base, &base),
            outbox_ack: (acknowledged > 0).then_some(acked),
            meta,
            ..Default::default()
        })?;

        state.base = Arc::new(base);
        state.cookie = Some(response.cookie);
        state.last_acked = acked;
        state.pinned = pinned;
        state.outbox.retain(|m| m.id > acked);
        if state.next_id <= acked {
            state.next_id = acked + 1;
        }

        info!(
            cookie = response.cookie,
            patch = response.patch.len(),
            acknowledged,
            pending = state.outbox.len(),
            changed = commit.changed.len(),
            "Reconciled with authority"
        );

        Ok(SyncReport {
            pushed: 0,
            acknowledged,
            changed: commit.changed,
        })
    }

    /// Push whenever mutations arrive, pull on pokes and every `poll_interval`,
    /// until `shutdown` flips to true.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut pokes = self.channel.pokes();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = poll_interval.as_secs(),
            "Sync loop started"
        );

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
                _ = self.push_wanted.notified() => {
                    if self.push().await.is_ok() {
                        let _ = self.pull().await;
                    }
                }
                _ = self.poke.notified() => {
                    let _ = self.pull().await;
                }
                received = next_poke(&mut pokes) => {
                    if received {
                        let _ = self.pull().await;
                    } else {
                        pokes = None;
                    }
                }
                _ = ticker.tick() => {
                    let _ = self.push().await;
                    let _ = self.pull().await;
                }
            }
        }

        info!("Sync loop stopped");
    }
}

fn pin_to_base(tx: &mut WriteTransaction, base: &Entries, key: &str) {
    match base.get(key) {
        Some(value) => tx.put_value(key, value.clone()),
        None => tx.delete(key),
    }
}

/// Waits for the next poke. Resolves to false once the sender is gone and
/// never resolves without a receiver.
async fn next_poke(pokes: &mut Option<broadcast::Receiver<()>>) -> bool {
    match pokes {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(()) => return true,
                Err(broadcast::error::RecvError::Lagged(_)) => return true,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        },
        None => std::future::pending().await,
    }
}

/// Typed front end for the built-in mutators.
pub struct Mutate<'a> {
    engine: &'a SyncEngine,
}

impl Mutate<'_> {
    fn call<A: Serialize>(&self, name: &str, args: &A) -> Result<Commit> {
        self.engine.call(name, serde_json::to_value(args)?)
    }

    pub fn add_feed(&self, feed: ApiFeed, from_search: bool) -> Result<Commit> {
        self.call(names::ADD_FEED, &AddFeedArgs { feed, from_search })
    }

    pub fn add_feeds(&self, feeds: Vec<ApiFeed>, from_search: bool) -> Result<Commit> {
        let args = AddFeedsArgs {
            feeds: feeds.into_iter().map(FeedArg::from).collect(),
            from_search,
        };
        self.call(names::ADD_FEEDS, &args)
    }

    pub fn update_feed(&self, update: FeedUpdate) -> Result<Commit> {
        self.call(names::UPDATE_FEED, &update)
    }

    pub fn update_feed_last_accessed_at(&self, feed_id: &str) -> Result<Commit> {
        self.call(names::UPDATE_FEED_LAST_ACCESSED_AT, &feed_id)
    }

    pub fn delete_feed(&self, feed_id: &str) -> Result<Commit> {
        self.call(names::DELETE_FEED, &feed_id)
    }

    pub fn subscribe_to_feed(&self, feed_id: &str) -> Result<Commit> {
        self.call(names::SUBSCRIBE_TO_FEED, &feed_id)
    }

    pub fn unsubscribe_from_feed(&self, feed_id: &str) -> Result<Commit> {
        self.call(names::UNSUBSCRIBE_FROM_FEED, &feed_id)
    }

    pub fn add_episodes_for_feed(&self, episodes: Vec<ApiEpisode>) -> Result<Commit> {
        self.call(names::ADD_EPISODES_FOR_FEED, &episodes)
    }

    pub fn delete_episodes_for_feed(&self, feed_id: &str) -> Result<Commit> {
        self.call(names::DELETE_EPISODES_FOR_FEED, &feed_id)
    }

    pub fn update_episode(&self, update: EpisodeUpdate) -> Result<Commit> {
        self.call(names::UPDATE_EPISODE, &update)
    }

    pub fn update_progress_for_episode(
        &self,
        episode_id: &str,
        progress: f64,
        played: Option<bool>,
    ) -> Result<Commit> {
        let args = ProgressArgs {
            id: episode_id.to_string(),
            progress,
            played,
        };
        self.call(names::UPDATE_PROGRESS_FOR_EPISODE, &args)
    }

    pub fn set_current_episode(&self, episode_id: &str) -> Result<Commit> {
        self.call(names::SET_CURRENT_EPISODE, &episode_id)
    }

    pub fn set_player_speed(&self, speed: f64) -> Result<Commit> {
        self.call(names::SET_PLAYER_SPEED, &speed)
    }

    pub fn set_audio_volume(&self, volume: f64) -> Result<Commit> {
        self.call(names::SET_AUDIO_VOLUME, &volume)
    }
}
