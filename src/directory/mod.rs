//! Remote podcast directory.

pub mod dto;
pub mod podcast_index;

use async_trait::async_trait;

use crate::app::{PodsyncError, Result};
use crate::domain::{ApiEpisode, ApiFeed};

pub use podcast_index::{Credentials, PodcastIndexClient};

/// The directory calls the cache needs. Implementations fail with
/// [`PodsyncError::Directory`](crate::app::PodsyncError::Directory) when
/// the service reports an unsuccessful status.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn search_by_term(&self, query: &str) -> Result<Vec<ApiFeed>>;

    async fn trending(&self) -> Result<Vec<ApiFeed>>;

    async fn podcast_by_id(&self, feed_id: &str) -> Result<ApiFeed>;

    async fn episodes_by_podcast_id(&self, feed_id: &str) -> Result<Vec<ApiEpisode>>;
}

/// Stand-in used when no API credentials are configured. Every call fails
/// without touching the network.
pub struct Unconfigured;

impl Unconfigured {
    fn error() -> PodsyncError {
        PodsyncError::Config(format!(
            "PodcastIndex credentials missing; set them under [directory] or via {} and {}",
            podcast_index::API_KEY_ENV,
            podcast_index::API_SECRET_ENV
        ))
    }
}

#[async_trait]
impl Directory for Unconfigured {
    async fn search_by_term(&self, _query: &str) -> Result<Vec<ApiFeed>> {
        Err(Self::error())
    }

    async fn trending(&self) -> Result<Vec<ApiFeed>> {
        Err(Self::error())
    }

    async fn podcast_by_id(&self, _feed_id: &str) -> Result<ApiFeed> {
        Err(Self::error())
    }

    async fn episodes_by_podcast_id(&self, _feed_id: &str) -> Result<Vec<ApiEpisode>> {
        Err(Self::error())
    }
}
