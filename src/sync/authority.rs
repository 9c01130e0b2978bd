//! In-process sync authority.
//!
//! Replays pushed mutations against its own cache with the same registry the
//! clients use, tracks which keys changed at which version, and answers
//! pulls with the patch since a client's cookie. Used for single-device
//! setups and in tests; a remote server speaks the same protocol over
//! [`HttpSyncChannel`](crate::sync::HttpSyncChannel).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app::error::lock;
use crate::app::Result;
use crate::mutation::{MutationContext, MutationRegistry};
use crate::store::{Batch, Cache, Commit, ReadTransaction, Store};
use crate::sync::{PatchOp, PullRequest, PullResponse, PushRequest, SyncChannel};

const VERSION_KEY: &str = "authority_version";
const CLIENT_PREFIX: &str = "client/";

struct AuthorityState {
    version: u64,
    /// Versions at or below this have no change history; pulls from
    /// before it get a full snapshot.
    floor: u64,
    changed_at: BTreeMap<String, u64>,
    last_mutation_ids: HashMap<String, u64>,
}

pub struct LocalAuthority {
    cache: Cache,
    registry: Arc<MutationRegistry>,
    state: Mutex<AuthorityState>,
    pokes: broadcast::Sender<()>,
}

impl LocalAuthority {
    pub fn open(store: Arc<dyn Store>, registry: Arc<MutationRegistry>) -> Result<Self> {
        let version: u64 = store
            .meta(VERSION_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let cache = Cache::open(store)?;
        let (pokes, _) = broadcast::channel(16);

        Ok(Self {
            cache,
            registry,
            state: Mutex::new(AuthorityState {
                version,
                floor: version,
                changed_at: BTreeMap::new(),
                last_mutation_ids: HashMap::new(),
            }),
            pokes,
        })
    }

    pub fn in_memory() -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::in_memory()?);
        Self::open(store, Arc::new(MutationRegistry::standard()))
    }

    pub fn version(&self) -> Result<u64> {
        Ok(lock(&self.state, "authority state")?.version)
    }

    pub fn query<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        self.cache.query(f)
    }

    fn last_mutation_id(&self, state: &mut AuthorityState, client_id: &str) -> Result<u64> {
        if let Some(id) = state.last_mutation_ids.get(client_id) {
            return Ok(*id);
        }
        let id = self
            .cache
            .store()
            .meta(&format!("{}{}", CLIENT_PREFIX, client_id))?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        state.last_mutation_ids.insert(client_id.to_string(), id);
        Ok(id)
    }

    fn record(&self, state: &mut AuthorityState, commit: &Commit) {
        if commit.is_noop() {
            return;
        }
        state.version += 1;
        for key in &commit.changed {
            state.changed_at.insert(key.clone(), state.version);
        }
    }

    /// Apply a mutation that originates on the authority itself, e.g. an
    /// edit from another device already merged server side.
    pub fn apply_local(&self, name: &str, args: Value) -> Result<Commit> {
        let mut state = lock(&self.state, "authority state")?;
        let mut tx = self.cache.begin_write()?;
        self.registry
            .apply(&mut tx, &MutationContext::now(), name, &args)?;
        let commit = tx.commit_with(Batch {
            meta: vec![(VERSION_KEY.to_string(), (state.version + 1).to_string())],
            ..Default::default()
        })?;
        self.record(&mut state, &commit);
        drop(state);
        let _ = self.pokes.send(());
        Ok(commit)
    }

    /// Replay a client's mutations in order, skipping ids already applied.
    /// A mutation that fails is logged and counts as processed.
    pub fn process_push(&self, request: &PushRequest) -> Result<usize> {
        let mut state = lock(&self.state, "authority state")?;
        let mut last = self.last_mutation_id(&mut state, &request.client_id)?;
        let mut applied = 0;

        for mutation in &request.mutations {
            if mutation.id <= last {
                continue;
            }
            if mutation.id != last + 1 {
                warn!(
                    client_id = %request.client_id,
                    expected = last + 1,
                    got = mutation.id,
                    "Gap in mutation ids"
                );
            }

            let mut tx = self.cache.begin_write()?;
            let ctx = MutationContext::new(mutation.created_at);
            if let Err(e) = self
                .registry
                .apply(&mut tx, &ctx, &mutation.name, &mutation.args)
            {
                warn!(
                    client_id = %request.client_id,
                    mutation = %mutation.name,
                    id = mutation.id,
                    error = %e,
                    "Mutation rejected by authority"
                );
                tx.rollback();
                tx = self.cache.begin_write()?;
            }

            let commit = tx.commit_with(Batch {
                meta: vec![
                    (
                        format!("{}{}", CLIENT_PREFIX, request.client_id),
                        mutation.id.to_string(),
                    ),
                    (VERSION_KEY.to_string(), (state.version + 1).to_string()),
                ],
                ..Default::default()
            })?;
            self.record(&mut state, &commit);
            last = mutation.id;
            applied += 1;
        }

        state
            .last_mutation_ids
            .insert(request.client_id.clone(), last);
        drop(state);

        if applied > 0 {
            debug!(client_id = %request.client_id, applied, "Processed push");
            let _ = self.pokes.send(());
        }
        Ok(applied)
    }

    /// Patch from `cookie` to the current version for one client.
    pub fn pull_for(&self, client_id: &str, cookie: Option<u64>) -> Result<PullResponse> {
        let mut state = lock(&self.state, "authority state")?;
        let last_mutation_id = self.last_mutation_id(&mut state, client_id)?;
        let snapshot = self.cache.snapshot()?;
        let since = cookie.unwrap_or(0);

        let patch = if cookie.is_none() || since < state.floor || since > state.version {
            let mut patch = vec![PatchOp::Clear];
            patch.extend(snapshot.iter().map(|(key, value)| PatchOp::Put {
                key: key.clone(),
                value: value.clone(),
            }));
            patch
        } else {
            state
                .changed_at
                .iter()
                .filter(|(_, at)| **at > since)
                .map(|(key, _)| match snapshot.get(key) {
                    Some(value) => PatchOp::Put {
                        key: key.clone(),
                        value: value.clone(),
                    },
                    None => PatchOp::Del { key: key.clone() },
                })
                .collect()
        };

        Ok(PullResponse {
            cookie: state.version,
            last_mutation_id,
            patch,
        })
    }

    pub fn close(&self) {
        self.cache.close();
        info!("Local authority closed");
    }
}

#[async_trait]
impl SyncChannel for LocalAuthority {
    async fn push(&self, request: &PushRequest) -> Result<()> {
        self.process_push(request).map(|_| ())
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        self.pull_for(&request.client_id, request.cookie)
    }

    fn pokes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.pokes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PendingMutation;
    use crate::mutation::mutators::names;
    use chrono::Utc;
    use serde_json::json;

    fn mutation(id: u64, name: &str, args: Value) -> PendingMutation {
        PendingMutation {
            id,
            name: name.into(),
            args,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_push_skips_seen_ids() {
        let authority = LocalAuthority::in_memory().unwrap();
        let request = PushRequest {
            client_id: "c1".into(),
            mutations: vec![
                mutation(1, names::SET_PLAYER_SPEED, json!(1.5)),
                mutation(2, names::SET_AUDIO_VOLUME, json!(0.5)),
            ],
        };
        assert_eq!(authority.process_push(&request).unwrap(), 2);
        assert_eq!(authority.process_push(&request).unwrap(), 0);
        assert_eq!(authority.pull_for("c1", None).unwrap().last_mutation_id, 2);
        assert_eq!(authority.pull_for("c2", None).unwrap().last_mutation_id, 0);
    }

    #[test]
    fn test_rejected_mutation_is_acknowledged() {
        let authority = LocalAuthority::in_memory().unwrap();
        let request = PushRequest {
            client_id: "c1".into(),
            mutations: vec![mutation(1, names::SUBSCRIBE_TO_FEED, json!("ghost"))],
        };
        assert_eq!(authority.process_push(&request).unwrap(), 1);
        let response = authority.pull_for("c1", None).unwrap();
        assert_eq!(response.last_mutation_id, 1);
        assert_eq!(response.patch, vec![PatchOp::Clear]);
    }

    #[test]
    fn test_incremental_pull() {
        let authority = LocalAuthority::in_memory().unwrap();
        authority.apply_local(names::SET_PLAYER_SPEED, json!(1.5)).unwrap();
        let first = authority.pull_for("c1", None).unwrap();
        assert_eq!(first.cookie, 1);

        authority.apply_local(names::SET_AUDIO_VOLUME, json!(0.5)).unwrap();
        let second = authority.pull_for("c1", Some(first.cookie)).unwrap();
        assert_eq!(second.cookie, 2);
        assert_eq!(
            second.patch,
            vec![PatchOp::Put {
                key: "/volume".into(),
                value: json!(0.5)
            }]
        );

        let third = authority.pull_for("c1", Some(second.cookie)).unwrap();
        assert!(third.patch.is_empty());
    }

    #[test]
    fn test_pull_from_before_restart_gets_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authority.db");
        let open = || {
            let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(&path).unwrap());
            LocalAuthority::open(store, Arc::new(MutationRegistry::standard())).unwrap()
        };
        {
            let authority = open();
            authority.apply_local(names::SET_PLAYER_SPEED, json!(2.0)).unwrap();
        }

        let authority = open();
        assert_eq!(authority.version().unwrap(), 1);
        let response = authority.pull_for("c1", Some(0)).unwrap();
        assert_eq!(response.patch[0], PatchOp::Clear);
        assert!(response.patch.contains(&PatchOp::Put {
            key: "/player-speed".into(),
            value: json!(2.0)
        }));
    }
}
