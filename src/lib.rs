//! # podsync
//!
//! A local-first podcast client.
//!
//! ## Architecture
//!
//! ```text
//! mutate.<name>(args) → Cache (optimistic) → outbox → push ─┐
//!                                                             ▼
//!             Cache ← reconcile ← pull ← authority (replays the same mutators)
//!
//! StalenessScheduler → TaskQueue (+ retry) → Directory → mutators → Cache
//! ```
//!
//! Every write goes through a named mutator, so the client and the authority
//! run identical code and the client can replay its pending work on top of
//! whatever the authority sends back.
//!
//! ## Quick Start
//!
//! ```bash
//! export PODCAST_INDEX_API_KEY=... PODCAST_INDEX_API_SECRET=...
//! podsync search "rust"
//! podsync subscribe 920666
//! podsync episodes 920666
//! podsync daemon start
//! ```

/// Application context and error handling.
///
/// [`AppContext`](app::AppContext) wires the cache, sync engine, directory
/// client, media store, scheduler and player for one process.
pub mod app;

/// Command-line interface using clap.
pub mod cli;

/// TOML configuration from `~/.config/podsync/config.toml`.
pub mod config;

/// Remote podcast directory (PodcastIndex).
pub mod directory;

/// Core domain models and the cache key layout.
///
/// - [`Feed`](domain::Feed): a podcast plus freshness metadata
/// - [`Episode`](domain::Episode): an episode plus playback state
/// - [`PendingMutation`](domain::PendingMutation): an outbox entry
pub mod domain;

/// Non-persistent observable state such as the transport controls.
pub mod ephemeral;

/// Downloaded audio and the cancellable downloader.
pub mod media;

/// Named mutators, the registry that runs them, and read queries.
pub mod mutation;

/// Bounded-concurrency task queue and retry policy.
pub mod queue;

/// Staleness sweep and the background daemon.
pub mod scheduler;

/// Versioned key/value cache over SQLite persistence.
///
/// - [`Store`](store::Store): persistence trait
/// - [`SqliteStore`](store::SqliteStore): SQLite implementation
/// - [`Cache`](store::Cache): snapshots, write transactions, subscriptions
pub mod store;

/// Optimistic sync: outbox, push/pull, reconciliation.
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;
