//! Optimistic replication of cache mutations.
//!
//! The client applies a mutation locally right away and keeps it in an
//! outbox. Pushing ships the outbox to an authority, which replays each
//! mutation against its own state. Pulling brings back a patch from the
//! client's cookie to the authority's current version together with the
//! id of the last mutation it has applied for this client. Reconciliation
//! rebuilds the visible state from the new authoritative base plus
//! whatever is still unacknowledged.

pub mod authority;
pub mod engine;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::app::Result;
use crate::domain::PendingMutation;
use crate::store::Entries;

pub use authority::LocalAuthority;
pub use engine::{Mutate, SyncEngine, SyncReport, SyncStatus};
pub use http::HttpSyncChannel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub client_id: String,
    pub mutations: Vec<PendingMutation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub client_id: String,
    /// Authority version the client last reconciled with.
    #[serde(default)]
    pub cookie: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub cookie: u64,
    /// Highest mutation id from this client the authority has applied.
    pub last_mutation_id: u64,
    pub patch: Vec<PatchOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Put { key: String, value: Value },
    Del { key: String },
    /// Drop everything; the ops that follow are a full snapshot.
    Clear,
}

impl PatchOp {
    pub fn key(&self) -> Option<&str> {
        match self {
            PatchOp::Put { key, .. } | PatchOp::Del { key } => Some(key),
            PatchOp::Clear => None,
        }
    }
}

pub fn apply_patch(entries: &mut Entries, patch: &[PatchOp]) {
    for op in patch {
        match op {
            PatchOp::Put { key, value } => {
                entries.insert(key.clone(), value.clone());
            }
            PatchOp::Del { key } => {
                entries.remove(key);
            }
            PatchOp::Clear => entries.clear(),
        }
    }
}

/// Transport to the sync authority.
#[async_trait]
pub trait SyncChannel: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<()>;

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse>;

    /// Notifications that the authority has new state worth pulling.
    /// Channels without pokes rely on periodic polling.
    fn pokes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}
