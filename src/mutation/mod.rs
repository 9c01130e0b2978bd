//! Named, replayable cache mutations.
//!
//! A mutator is a function `(WriteTransaction, args)` that reads the
//! entities it touches, merges, and writes them back. The same mutator runs
//! optimistically on the client and again on the sync authority, so every
//! mutator must tolerate targets that are absent, updated or deleted.

pub mod mutators;
pub mod queries;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::app::{PodsyncError, Result};
use crate::store::{Cache, Commit, WriteTransaction};

/// Inputs a mutator may depend on besides its arguments. Replays reuse the
/// context captured at call time so they produce the same result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutationContext {
    pub now: DateTime<Utc>,
}

impl MutationContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn now() -> Self {
        Self { now: Utc::now() }
    }
}

pub trait Mutator: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, tx: &mut WriteTransaction, ctx: &MutationContext, args: &Value) -> Result<()>;
}

/// Adapts a typed function into a [`Mutator`], decoding its arguments.
pub struct FnMutator<A, F> {
    name: &'static str,
    f: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F> FnMutator<A, F>
where
    A: DeserializeOwned,
    F: Fn(&mut WriteTransaction, &MutationContext, A) -> Result<()> + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self {
            name,
            f,
            _args: PhantomData,
        }
    }
}

impl<A, F> Mutator for FnMutator<A, F>
where
    A: DeserializeOwned,
    F: Fn(&mut WriteTransaction, &MutationContext, A) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, tx: &mut WriteTransaction, ctx: &MutationContext, args: &Value) -> Result<()> {
        let args: A =
            serde_json::from_value(args.clone()).map_err(|e| PodsyncError::InvalidArgs {
                name: self.name.to_string(),
                reason: e.to_string(),
            })?;
        (self.f)(tx, ctx, args)
    }
}

/// Mutators by name, fixed once the engine starts.
#[derive(Clone, Default)]
pub struct MutationRegistry {
    mutators: HashMap<&'static str, Arc<dyn Mutator>>,
}

impl MutationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in mutator.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        mutators::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, mutator: Arc<dyn Mutator>) -> Result<()> {
        let name = mutator.name();
        if self.mutators.contains_key(name) {
            return Err(PodsyncError::DuplicateMutation {
                name: name.to_string(),
            });
        }
        self.mutators.insert(name, mutator);
        Ok(())
    }

    pub fn register_fn<A, F>(&mut self, name: &'static str, f: F) -> Result<()>
    where
        A: DeserializeOwned + 'static,
        F: Fn(&mut WriteTransaction, &MutationContext, A) -> Result<()> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnMutator::new(name, f)))
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Mutator>> {
        self.mutators
            .get(name)
            .cloned()
            .ok_or_else(|| PodsyncError::UnknownMutation(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mutators.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.mutators.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run one mutator inside an open transaction.
    pub fn apply(
        &self,
        tx: &mut WriteTransaction,
        ctx: &MutationContext,
        name: &str,
        args: &Value,
    ) -> Result<()> {
        let mutator = self.get(name)?;
        debug!(mutation = name, "Applying mutation");
        mutator.apply(tx, ctx, args)
    }

    /// Run one mutator in its own write transaction and commit it.
    pub fn execute(
        &self,
        cache: &Cache,
        ctx: &MutationContext,
        name: &str,
        args: &Value,
    ) -> Result<Commit> {
        let mut tx = cache.begin_write()?;
        self.apply(&mut tx, ctx, name, args)?;
        tx.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Reader;
    use serde_json::json;

    #[test]
    fn test_register_and_execute() {
        let mut registry = MutationRegistry::new();
        registry
            .register_fn("setFlag", |tx, _ctx, on: bool| tx.set("/flag", &on))
            .unwrap();

        let cache = Cache::in_memory().unwrap();
        registry
            .execute(&cache, &MutationContext::now(), "setFlag", &json!(true))
            .unwrap();
        assert_eq!(cache.begin_read().unwrap().get::<bool>("/flag").unwrap(), Some(true));
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut registry = MutationRegistry::standard();
        let err = registry
            .register_fn("addFeed", |_tx, _ctx, _: Value| Ok(()))
            .unwrap_err();
        assert!(matches!(err, PodsyncError::DuplicateMutation { .. }));
    }

    #[test]
    fn test_unknown_mutation() {
        let registry = MutationRegistry::standard();
        let cache = Cache::in_memory().unwrap();
        let err = registry
            .execute(&cache, &MutationContext::now(), "launchRocket", &json!(null))
            .unwrap_err();
        assert!(matches!(err, PodsyncError::UnknownMutation(name) if name == "launchRocket"));
    }

    #[test]
    fn test_bad_args_leave_cache_untouched() {
        let registry = MutationRegistry::standard();
        let cache = Cache::in_memory().unwrap();
        let err = registry
            .execute(&cache, &MutationContext::now(), "setPlayerSpeed", &json!("fast"))
            .unwrap_err();
        assert!(matches!(err, PodsyncError::InvalidArgs { .. }));
        assert_eq!(cache.version(), 0);
    }

    #[test]
    fn test_standard_registry_names() {
        let names = MutationRegistry::standard().names();
        for name in [
            "addFeed",
            "addFeeds",
            "subscribeToFeed",
            "unsubscribeFromFeed",
            "addEpisodesForFeed",
            "updateProgressForEpisode",
            "setCurrentEpisode",
            "deleteFeed",
        ] {
            assert!(names.contains(&name), "missing {}", name);
        }
    }
}
