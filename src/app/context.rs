use std::sync::Arc;

use tracing::info;

use crate::app::error::{PodsyncError, Result};
use crate::config::Config;
use crate::directory::{Directory, PodcastIndexClient, Unconfigured};
use crate::ephemeral::Player;
use crate::media::{Downloader, MediaStore};
use crate::mutation::MutationRegistry;
use crate::queue::{RetryPolicy, TaskQueue};
use crate::scheduler::StalenessScheduler;
use crate::store::{Cache, SqliteStore, Store};
use crate::sync::{HttpSyncChannel, LocalAuthority, SyncChannel, SyncEngine};

/// Every long-lived component, wired once per process. Nothing here is
/// global; dropping or closing the context tears it all down.
pub struct AppContext {
    pub config: Config,
    pub cache: Arc<Cache>,
    pub engine: Arc<SyncEngine>,
    /// Present when syncing against the in-process authority.
    pub authority: Option<Arc<LocalAuthority>>,
    pub directory: Arc<dyn Directory>,
    pub media: Arc<dyn MediaStore>,
    pub queue: TaskQueue,
    pub scheduler: Arc<StalenessScheduler>,
    pub downloader: Downloader,
    pub player: Player,
}

impl AppContext {
    pub fn open(config: Config) -> Result<Self> {
        let data_dir = config
            .data_dir()
            .map_err(|e| PodsyncError::Config(e.to_string()))?;
        std::fs::create_dir_all(&data_dir)?;

        let registry = Arc::new(MutationRegistry::standard());
        let store = Arc::new(SqliteStore::new(data_dir.join("client.db"))?);

        let mut authority = None;
        let channel: Arc<dyn SyncChannel> = match &config.sync.server_url {
            Some(url) => Arc::new(HttpSyncChannel::new(url)?),
            None => {
                let authority_store: Arc<dyn Store> =
                    Arc::new(SqliteStore::new(data_dir.join("authority.db"))?);
                let local = Arc::new(LocalAuthority::open(authority_store, registry.clone())?);
                authority = Some(local.clone());
                local
            }
        };

        info!(data_dir = %data_dir.display(), remote = config.sync.server_url.is_some(), "Opening podsync");
        Self::assemble(config, store, registry, channel, authority)
    }

    /// Everything in memory, syncing against a fresh local authority.
    pub fn in_memory() -> Result<Self> {
        let registry = Arc::new(MutationRegistry::standard());
        let store = Arc::new(SqliteStore::in_memory()?);
        let authority_store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory()?);
        let authority = Arc::new(LocalAuthority::open(authority_store, registry.clone())?);
        Self::assemble(
            Config::default(),
            store,
            registry,
            authority.clone(),
            Some(authority),
        )
    }

    fn assemble(
        config: Config,
        store: Arc<SqliteStore>,
        registry: Arc<MutationRegistry>,
        channel: Arc<dyn SyncChannel>,
        authority: Option<Arc<LocalAuthority>>,
    ) -> Result<Self> {
        let media: Arc<dyn MediaStore> = store.clone();
        let cache = Arc::new(Cache::open(store)?);
        let engine = Arc::new(SyncEngine::open(
            cache.clone(),
            registry,
            channel,
            RetryPolicy::new(config.sync.retry_attempts),
        )?);

        let directory: Arc<dyn Directory> = match config.directory.credentials() {
            Some(credentials) => Arc::new(
                PodcastIndexClient::new(credentials)?
                    .with_base_url(&config.directory.base_url)?
                    .with_retry(RetryPolicy::new(config.directory.retry_attempts))
                    .with_max_results(config.directory.max_results),
            ),
            None => Arc::new(Unconfigured),
        };

        let queue = TaskQueue::with_throttle(config.queue.concurrency, config.queue.min_interval);
        let scheduler = Arc::new(StalenessScheduler::new(
            engine.clone(),
            directory.clone(),
            media.clone(),
            queue.clone(),
            config.queue.retry_policy(),
            config.scheduler.policy(),
        ));
        let downloader = Downloader::new(media.clone(), engine.clone())?;
        let player = Player::new(engine.clone());

        Ok(Self {
            config,
            cache,
            engine,
            authority,
            directory,
            media,
            queue,
            scheduler,
            downloader,
            player,
        })
    }

    /// Stop accepting writes and drop every subscription.
    pub fn close(&self) {
        self.cache.close();
        if let Some(authority) = &self.authority {
            authority.close();
        }
        info!("podsync closed");
    }
}
