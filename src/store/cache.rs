//! Versioned key/value cache.
//!
//! Readers get an immutable snapshot; writers buffer changes in a
//! [`WriteTransaction`] and publish them atomically on commit. Only one
//! writer runs at a time. Every commit that changes visible state bumps the
//! version and re-runs the subscriptions whose reads it touched.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::app::error::lock;
use crate::app::{PodsyncError, Result};
use crate::store::{apply_changes, diff, schema, Batch, ChangeSet, Entries, SqliteStore, Store};

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub version: u64,
    /// Keys whose visible value changed.
    pub changed: BTreeSet<String>,
}

impl Commit {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Read access shared by read and write transactions.
pub trait Reader {
    fn get_value(&self, key: &str) -> Option<Value>;

    /// Entries whose key starts with `prefix`, in key order.
    fn scan_values(&self, prefix: &str) -> Vec<(String, Value)>;

    fn has(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_value(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.scan_values(prefix)
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(PodsyncError::from))
            .collect()
    }
}

fn scan_entries<'a>(entries: &'a Entries, prefix: &str) -> impl Iterator<Item = (String, Value)> + 'a {
    let prefix = prefix.to_string();
    entries
        .range(prefix.clone()..)
        .take_while(move |(key, _)| key.starts_with(&prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
}

#[derive(Debug, Default, Clone)]
struct Deps {
    keys: BTreeSet<String>,
    prefixes: BTreeSet<String>,
}

impl Deps {
    fn touched_by(&self, changed: &BTreeSet<String>) -> bool {
        changed.iter().any(|key| {
            self.keys.contains(key) || self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
        })
    }
}

/// Consistent view of one cache version.
pub struct ReadTransaction {
    version: u64,
    entries: Arc<Entries>,
    deps: RefCell<Deps>,
}

impl ReadTransaction {
    pub fn version(&self) -> u64 {
        self.version
    }

    fn into_deps(self) -> Deps {
        self.deps.into_inner()
    }
}

impl Reader for ReadTransaction {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.deps.borrow_mut().keys.insert(key.to_string());
        self.entries.get(key).cloned()
    }

    fn scan_values(&self, prefix: &str) -> Vec<(String, Value)> {
        self.deps.borrow_mut().prefixes.insert(prefix.to_string());
        scan_entries(&self.entries, prefix).collect()
    }
}

/// Buffered writes over a base snapshot. Nothing is visible to readers
/// until the owning [`WriteHandle`] commits.
#[derive(Debug, Clone)]
pub struct WriteTransaction {
    base: Arc<Entries>,
    changes: ChangeSet,
}

impl WriteTransaction {
    pub fn new(base: Arc<Entries>) -> Self {
        Self {
            base,
            changes: ChangeSet::new(),
        }
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: Value) {
        self.changes.insert(key.into(), Some(value));
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.put_value(key, serde_json::to_value(value)?);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.changes.insert(key.into(), None);
    }

    /// Read-modify-write of one typed entry. Returning `None` deletes it.
    pub fn update<T, F>(&mut self, key: &str, f: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<Option<T>>,
    {
        let current = self.get::<T>(key)?;
        let existed = current.is_some();
        match f(current)? {
            Some(next) => self.set(key, &next),
            None => {
                if existed {
                    self.delete(key);
                }
                Ok(())
            }
        }
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn checkpoint(&self) -> ChangeSet {
        self.changes.clone()
    }

    pub fn restore(&mut self, checkpoint: ChangeSet) {
        self.changes = checkpoint;
    }

    pub fn apply_changes(&mut self, changes: &ChangeSet) {
        for (key, change) in changes {
            self.changes.insert(key.clone(), change.clone());
        }
    }

    /// Replace the buffered changes with whatever turns the base into `target`.
    pub fn reset_to(&mut self, target: &Entries) {
        self.changes = diff(&self.base, target);
    }

    /// Materialized view of base plus buffered changes.
    pub fn entries(&self) -> Entries {
        let mut entries = (*self.base).clone();
        apply_changes(&mut entries, &self.changes);
        entries
    }

    fn effective_changes(&self) -> ChangeSet {
        self.changes
            .iter()
            .filter(|(key, change)| self.base.get(key.as_str()) != change.as_ref())
            .map(|(key, change)| (key.clone(), change.clone()))
            .collect()
    }
}

impl Reader for WriteTransaction {
    fn get_value(&self, key: &str) -> Option<Value> {
        match self.changes.get(key) {
            Some(change) => change.clone(),
            None => self.base.get(key).cloned(),
        }
    }

    fn scan_values(&self, prefix: &str) -> Vec<(String, Value)> {
        let mut merged: Entries = scan_entries(&self.base, prefix).collect();
        let pending = self
            .changes
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix));
        for (key, change) in pending {
            match change {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

trait Watcher: Send + Sync {
    /// Re-run if `changed` touches the watcher's reads. Returns false once
    /// the receiving side is gone.
    fn notify(&self, version: u64, entries: &Arc<Entries>, changed: &BTreeSet<String>) -> bool;
}

struct Subscription<T, F> {
    query: F,
    sender: watch::Sender<T>,
    deps: Mutex<Deps>,
}

impl<T, F> Watcher for Subscription<T, F>
where
    T: PartialEq + Send + Sync + 'static,
    F: Fn(&ReadTransaction) -> Result<T> + Send + Sync + 'static,
{
    fn notify(&self, version: u64, entries: &Arc<Entries>, changed: &BTreeSet<String>) -> bool {
        if self.sender.is_closed() {
            return false;
        }
        let Ok(mut deps) = self.deps.lock() else {
            return false;
        };
        if !deps.touched_by(changed) {
            return true;
        }

        let tx = ReadTransaction {
            version,
            entries: Arc::clone(entries),
            deps: RefCell::default(),
        };
        let result = (self.query)(&tx);
        *deps = tx.into_deps();

        match result {
            Ok(value) => {
                self.sender.send_if_modified(|current| {
                    if *current == value {
                        false
                    } else {
                        *current = value;
                        true
                    }
                });
            }
            Err(e) => warn!(version, error = %e, "Subscription query failed"),
        }
        true
    }
}

struct State {
    version: u64,
    entries: Arc<Entries>,
}

pub struct Cache {
    store: Arc<dyn Store>,
    state: RwLock<State>,
    writer: Mutex<()>,
    watchers: Mutex<Vec<Box<dyn Watcher>>>,
    closed: AtomicBool,
}

impl Cache {
    /// Load persisted state, upgrading legacy records first.
    pub fn open(store: Arc<dyn Store>) -> Result<Self> {
        let entries = store.load_entries()?;
        let base = store.load_base()?;
        let version = store
            .meta(schema::SCHEMA_VERSION_KEY)?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        let entries = if version < schema::SCHEMA_VERSION {
            let migrated = schema::migrate(&entries);
            let migrated_base = schema::migrate(&base);
            let batch = Batch {
                entries: diff(&entries, &migrated),
                base: diff(&base, &migrated_base),
                meta: vec![(
                    schema::SCHEMA_VERSION_KEY.to_string(),
                    schema::SCHEMA_VERSION.to_string(),
                )],
                ..Default::default()
            };
            debug!(
                from = version,
                to = schema::SCHEMA_VERSION,
                rewritten = batch.entries.len(),
                "Migrating cache schema"
            );
            store.commit(&batch)?;
            migrated
        } else {
            entries
        };

        Ok(Self {
            store,
            state: RwLock::new(State {
                version: 0,
                entries: Arc::new(entries),
            }),
            writer: Mutex::new(()),
            watchers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Arc::new(SqliteStore::in_memory()?))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn version(&self) -> u64 {
        self.state.read().map(|s| s.version).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Result<Arc<Entries>> {
        let state = self
            .state
            .read()
            .map_err(|e| PodsyncError::LockPoisoned(format!("cache state: {}", e)))?;
        Ok(Arc::clone(&state.entries))
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        let state = self
            .state
            .read()
            .map_err(|e| PodsyncError::LockPoisoned(format!("cache state: {}", e)))?;
        Ok(ReadTransaction {
            version: state.version,
            entries: Arc::clone(&state.entries),
            deps: RefCell::default(),
        })
    }

    pub fn query<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let tx = self.begin_read()?;
        f(&tx)
    }

    /// Start the single writer. Blocks while another write is open.
    pub fn begin_write(&self) -> Result<WriteHandle<'_>> {
        if self.is_closed() {
            return Err(PodsyncError::Closed);
        }
        let guard = lock(&self.writer, "cache writer")?;
        let base = self.snapshot()?;
        Ok(WriteHandle {
            cache: self,
            _guard: guard,
            tx: WriteTransaction::new(base),
        })
    }

    /// Run `f` in a write transaction and commit if it succeeds.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteTransaction) -> Result<R>) -> Result<R> {
        let mut handle = self.begin_write()?;
        let result = f(&mut handle)?;
        handle.commit()?;
        Ok(result)
    }

    /// Reactive query: the receiver sees the initial result and every later
    /// result that differs from the previous one.
    pub fn subscribe<T, F>(&self, query: F) -> Result<watch::Receiver<T>>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(&ReadTransaction) -> Result<T> + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(PodsyncError::Closed);
        }
        // Registering under the watcher lock keeps a concurrent commit from
        // slipping between the initial read and the registration.
        let mut watchers = lock(&self.watchers, "cache watchers")?;
        let tx = self.begin_read()?;
        let initial = query(&tx)?;
        let (sender, receiver) = watch::channel(initial);
        watchers.push(Box::new(Subscription {
            query,
            sender,
            deps: Mutex::new(tx.into_deps()),
        }));
        Ok(receiver)
    }

    /// Reject further writes and drop every subscription.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.clear();
        }
        debug!("Cache closed");
    }

    fn publish(&self, tx: WriteTransaction, mut batch: Batch) -> Result<Commit> {
        if self.is_closed() {
            return Err(PodsyncError::Closed);
        }
        let effective = tx.effective_changes();
        drop(tx);

        if effective.is_empty() && batch.is_empty() {
            return Ok(Commit {
                version: self.version(),
                changed: BTreeSet::new(),
            });
        }

        batch.entries = effective;
        self.store.commit(&batch)?;

        let changed: BTreeSet<String> = batch.entries.keys().cloned().collect();
        let (version, entries) = {
            let mut state = self
                .state
                .write()
                .map_err(|e| PodsyncError::LockPoisoned(format!("cache state: {}", e)))?;
            if !changed.is_empty() {
                apply_changes(Arc::make_mut(&mut state.entries), &batch.entries);
                state.version += 1;
            }
            (state.version, Arc::clone(&state.entries))
        };

        if !changed.is_empty() {
            let mut watchers = lock(&self.watchers, "cache watchers")?;
            watchers.retain(|watcher| watcher.notify(version, &entries, &changed));
        }

        Ok(Commit { version, changed })
    }
}

/// The open write transaction. Dropping it without committing rolls back.
pub struct WriteHandle<'a> {
    cache: &'a Cache,
    _guard: MutexGuard<'a, ()>,
    tx: WriteTransaction,
}

impl WriteHandle<'_> {
    pub fn commit(self) -> Result<Commit> {
        self.commit_with(Batch::default())
    }

    /// Commit together with extra durable state (base, outbox, metadata).
    /// `batch.entries` is replaced by this transaction's changes.
    pub fn commit_with(self, batch: Batch) -> Result<Commit> {
        let WriteHandle { cache, _guard, tx } = self;
        cache.publish(tx, batch)
    }

    pub fn rollback(self) {}
}

impl Deref for WriteHandle<'_> {
    type Target = WriteTransaction;

    fn deref(&self) -> &WriteTransaction {
        &self.tx
    }
}

impl DerefMut for WriteHandle<'_> {
    fn deref_mut(&mut self) -> &mut WriteTransaction {
        &mut self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_then_read() {
        let cache = Cache::in_memory().unwrap();
        cache
            .write(|tx| {
                tx.put_value("feed/1", json!({"id": "1"}));
                Ok(())
            })
            .unwrap();

        let tx = cache.begin_read().unwrap();
        assert_eq!(tx.get_value("feed/1"), Some(json!({"id": "1"})));
        assert_eq!(tx.version(), 1);
    }

    #[test]
    fn test_dropped_write_rolls_back() {
        let cache = Cache::in_memory().unwrap();
        {
            let mut tx = cache.begin_write().unwrap();
            tx.put_value("a", json!(1));
            assert_eq!(tx.get_value("a"), Some(json!(1)));
        }
        assert!(!cache.begin_read().unwrap().has("a"));
        assert_eq!(cache.version(), 0);
    }

    #[test]
    fn test_failed_closure_commits_nothing() {
        let cache = Cache::in_memory().unwrap();
        let result: Result<()> = cache.write(|tx| {
            tx.put_value("a", json!(1));
            Err(PodsyncError::Other("boom".into()))
        });
        assert!(result.is_err());
        assert!(!cache.begin_read().unwrap().has("a"));
    }

    #[test]
    fn test_reader_snapshot_is_stable() {
        let cache = Cache::in_memory().unwrap();
        cache.write(|tx| Ok(tx.put_value("a", json!(1)))).unwrap();
        let before = cache.begin_read().unwrap();
        cache.write(|tx| Ok(tx.put_value("a", json!(2)))).unwrap();

        assert_eq!(before.get_value("a"), Some(json!(1)));
        assert_eq!(cache.begin_read().unwrap().get_value("a"), Some(json!(2)));
    }

    #[test]
    fn test_scan_is_prefix_bounded_and_ordered() {
        let cache = Cache::in_memory().unwrap();
        cache
            .write(|tx| {
                tx.put_value("episode/f1/b", json!("b"));
                tx.put_value("episode/f1/a", json!("a"));
                tx.put_value("episode/f2/c", json!("c"));
                tx.put_value("feed/f1", json!("feed"));
                Ok(())
            })
            .unwrap();

        let tx = cache.begin_read().unwrap();
        let keys: Vec<String> = tx
            .scan_values("episode/f1/")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["episode/f1/a", "episode/f1/b"]);
    }

    #[test]
    fn test_write_scan_sees_own_changes() {
        let cache = Cache::in_memory().unwrap();
        cache
            .write(|tx| {
                tx.put_value("p/1", json!(1));
                tx.put_value("p/2", json!(2));
                Ok(())
            })
            .unwrap();

        let mut tx = cache.begin_write().unwrap();
        tx.delete("p/1");
        tx.put_value("p/3", json!(3));
        let values: Vec<Value> = tx.scan_values("p/").into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_set_then_revert_is_not_a_change() {
        let cache = Cache::in_memory().unwrap();
        cache.write(|tx| Ok(tx.put_value("a", json!(1)))).unwrap();

        let mut tx = cache.begin_write().unwrap();
        tx.put_value("a", json!(2));
        tx.put_value("a", json!(1));
        let commit = tx.commit().unwrap();
        assert!(commit.is_noop());
        assert_eq!(commit.version, 1);
    }

    #[test]
    fn test_checkpoint_restore() {
        let cache = Cache::in_memory().unwrap();
        let mut tx = cache.begin_write().unwrap();
        tx.put_value("a", json!(1));
        let checkpoint = tx.checkpoint();
        tx.put_value("b", json!(2));
        tx.restore(checkpoint);
        tx.commit().unwrap();

        let read = cache.begin_read().unwrap();
        assert!(read.has("a"));
        assert!(!read.has("b"));
    }

    #[test]
    fn test_update_deletes_on_none() {
        let cache = Cache::in_memory().unwrap();
        cache.write(|tx| tx.set("n", &5u32)).unwrap();
        cache
            .write(|tx| tx.update::<u32, _>("n", |old| Ok(old.map(|n| n + 1))))
            .unwrap();
        assert_eq!(cache.begin_read().unwrap().get::<u32>("n").unwrap(), Some(6));

        cache
            .write(|tx| tx.update::<u32, _>("n", |_| Ok(None)))
            .unwrap();
        assert!(!cache.begin_read().unwrap().has("n"));
    }

    #[tokio::test]
    async fn test_subscribe_notifies_on_relevant_change() {
        let cache = Cache::in_memory().unwrap();
        let mut rx = cache
            .subscribe(|tx| Ok(tx.scan_values("feed/").len()))
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), 0);

        cache.write(|tx| Ok(tx.put_value("feed/1", json!({})))).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        cache.write(|tx| Ok(tx.put_value("/volume", json!(0.5)))).unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_skips_equal_results() {
        let cache = Cache::in_memory().unwrap();
        cache.write(|tx| Ok(tx.put_value("feed/1", json!({"t": 1})))).unwrap();
        let mut rx = cache
            .subscribe(|tx| Ok(tx.scan_values("feed/").len()))
            .unwrap();
        rx.borrow_and_update();

        cache.write(|tx| Ok(tx.put_value("feed/1", json!({"t": 2})))).unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = Cache::open(Arc::new(SqliteStore::new(&path).unwrap())).unwrap();
            cache.write(|tx| Ok(tx.put_value("/player-speed", json!(1.5)))).unwrap();
        }
        let cache = Cache::open(Arc::new(SqliteStore::new(&path).unwrap())).unwrap();
        assert_eq!(
            cache.begin_read().unwrap().get::<f64>("/player-speed").unwrap(),
            Some(1.5)
        );
    }

    #[test]
    fn test_closed_cache_rejects_writes() {
        let cache = Cache::in_memory().unwrap();
        let rx = cache.subscribe(|tx| Ok(tx.has("a"))).unwrap();
        cache.close();
        assert!(matches!(cache.begin_write(), Err(PodsyncError::Closed)));
        assert!(rx.has_changed().is_err());
    }
}
