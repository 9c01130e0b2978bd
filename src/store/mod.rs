//! Durable storage and the versioned in-memory cache built on top of it.

pub mod cache;
pub mod schema;
pub mod sqlite;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::app::Result;
use crate::domain::PendingMutation;

pub use cache::{Cache, Commit, ReadTransaction, Reader, WriteHandle, WriteTransaction};
pub use sqlite::SqliteStore;

/// Ordered key/value state, the unit every snapshot is made of.
pub type Entries = BTreeMap<String, Value>;

/// Buffered writes: `Some` puts a value, `None` deletes the key.
pub type ChangeSet = BTreeMap<String, Option<Value>>;

/// Everything one commit persists, written atomically.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Changes to the visible cache state.
    pub entries: ChangeSet,
    /// Changes to the last authoritative state.
    pub base: ChangeSet,
    pub outbox_push: Vec<PendingMutation>,
    /// Drop outbox rows with an id at or below this value.
    pub outbox_ack: Option<u64>,
    pub meta: Vec<(String, String)>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.base.is_empty()
            && self.outbox_push.is_empty()
            && self.outbox_ack.is_none()
            && self.meta.is_empty()
    }
}

pub trait Store: Send + Sync {
    fn load_entries(&self) -> Result<Entries>;
    fn load_base(&self) -> Result<Entries>;
    fn load_outbox(&self) -> Result<Vec<PendingMutation>>;
    fn meta(&self, key: &str) -> Result<Option<String>>;
    fn commit(&self, batch: &Batch) -> Result<()>;
}

/// Changes that turn `from` into `to`.
pub fn diff(from: &Entries, to: &Entries) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, value) in to {
        if from.get(key) != Some(value) {
            changes.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in from.keys() {
        if !to.contains_key(key) {
            changes.insert(key.clone(), None);
        }
    }
    changes
}

pub fn apply_changes(entries: &mut Entries, changes: &ChangeSet) {
    for (key, change) in changes {
        match change {
            Some(value) => {
                entries.insert(key.clone(), value.clone());
            }
            None => {
                entries.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_then_apply_reaches_target() {
        let mut from = Entries::new();
        from.insert("a".into(), json!(1));
        from.insert("b".into(), json!(2));
        let mut to = Entries::new();
        to.insert("b".into(), json!(3));
        to.insert("c".into(), json!(4));

        let changes = diff(&from, &to);
        assert_eq!(changes.get("a"), Some(&None));
        assert_eq!(changes.get("b"), Some(&Some(json!(3))));

        apply_changes(&mut from, &changes);
        assert_eq!(from, to);
    }

    #[test]
    fn test_diff_of_equal_states_is_empty() {
        let mut entries = Entries::new();
        entries.insert("a".into(), json!({"x": 1}));
        assert!(diff(&entries, &entries.clone()).is_empty());
    }
}
