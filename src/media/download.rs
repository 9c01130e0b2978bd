//! Cancellable episode downloads into the media store.
//!
//! The body is buffered in memory and only stored once complete, so a
//! cancelled or failed download leaves neither a blob nor a changed episode.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::app::{PodsyncError, Result};
use crate::domain::EpisodeUpdate;
use crate::media::{MediaBlob, MediaStore};
use crate::mutation::queries;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadProgress {
    /// Whole percent, when the server sent a length.
    Percent(u8),
    /// Bytes received so far, when it did not.
    Bytes(u64),
    Done,
}

pub struct Downloader {
    client: Client,
    media: Arc<dyn MediaStore>,
    engine: Arc<SyncEngine>,
}

/// Resolves once the flag turns true. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Downloader {
    pub fn new(media: Arc<dyn MediaStore>, engine: Arc<SyncEngine>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .user_agent(crate::directory::podcast_index::USER_AGENT)
            .build()?;
        Ok(Self::with_client(client, media, engine))
    }

    pub fn with_client(client: Client, media: Arc<dyn MediaStore>, engine: Arc<SyncEngine>) -> Self {
        Self {
            client,
            media,
            engine,
        }
    }

    /// Fetch an episode's enclosure, store it, and mark the episode
    /// downloaded. Playback time is touched so the new download does not
    /// count as expired.
    pub async fn download(
        &self,
        episode_id: &str,
        progress: Option<mpsc::Sender<DownloadProgress>>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<MediaBlob> {
        let episode = self
            .engine
            .query(|tx| queries::get_episode_by_id(tx, episode_id))?
            .ok_or_else(|| PodsyncError::EpisodeNotFound(episode_id.to_string()))?;

        info!(episode_id, url = %episode.enclosure_url, "Downloading episode");

        let fetch = async {
            let mut response = self
                .client
                .get(&episode.enclosure_url)
                .send()
                .await?
                .error_for_status()?;

            let total = response.content_length().filter(|n| *n > 0);
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .unwrap_or_else(|| episode.enclosure_type.clone());

            let mut body = Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
            let mut last_percent = None;
            while let Some(chunk) = response.chunk().await? {
                body.extend_from_slice(&chunk);
                if let Some(tx) = &progress {
                    let update = match total {
                        Some(total) => {
                            let percent = ((body.len() as u64 * 100) / total).min(100) as u8;
                            if last_percent == Some(percent) {
                                continue;
                            }
                            last_percent = Some(percent);
                            DownloadProgress::Percent(percent)
                        }
                        None => DownloadProgress::Bytes(body.len() as u64),
                    };
                    let _ = tx.try_send(update);
                }
            }
            Ok::<_, PodsyncError>(MediaBlob::new(content_type, body))
        };

        let blob = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                debug!(episode_id, "Download cancelled");
                return Err(PodsyncError::Cancelled);
            }
            result = fetch => result?,
        };

        self.media.put(episode_id, blob.clone()).await?;

        let mut update = EpisodeUpdate::new(episode_id);
        update.downloaded = Some(true);
        update.last_played_at = Some(Utc::now());
        if let Err(e) = self.engine.mutate().update_episode(update) {
            warn!(episode_id, error = %e, "Marking download failed, removing blob");
            self.media.delete(episode_id).await?;
            return Err(e);
        }

        if let Some(tx) = &progress {
            let _ = tx.try_send(DownloadProgress::Done);
        }
        info!(episode_id, bytes = blob.len(), "Episode downloaded");
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryMediaStore;
    use crate::sync::LocalAuthority;
    use crate::test_support::{api_episode, engine_with};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Downloader, Arc<SyncEngine>, Arc<MemoryMediaStore>) {
        let (engine, _authority) = engine_with(LocalAuthority::in_memory().unwrap());
        let engine = Arc::new(engine);
        let mut episode = api_episode("e1", "f1", 60);
        episode.enclosure_url = format!("{}/e1.mp3", server.uri());
        engine.mutate().add_episodes_for_feed(vec![episode]).unwrap();

        let media = Arc::new(MemoryMediaStore::new());
        let downloader = Downloader::new(media.clone(), engine.clone()).unwrap();
        (downloader, engine, media)
    }

    #[tokio::test]
    async fn test_download_stores_blob_and_marks_episode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/e1.mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(vec![7u8; 4096]),
            )
            .mount(&server)
            .await;

        let (downloader, engine, media) = setup(&server).await;
        let (progress_tx, mut progress_rx) = mpsc::channel(256);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let blob = downloader
            .download("e1", Some(progress_tx), cancel_rx)
            .await
            .unwrap();
        assert_eq!(blob.len(), 4096);
        assert_eq!(blob.content_type, "audio/mpeg");
        assert!(media.contains("e1").await.unwrap());

        let episode = engine
            .query(|tx| queries::get_episode_by_id(tx, "e1"))
            .unwrap()
            .unwrap();
        assert!(episode.downloaded);
        assert!(episode.last_played_at.is_some());

        let mut last = None;
        while let Ok(update) = progress_rx.try_recv() {
            last = Some(update);
        }
        assert_eq!(last, Some(DownloadProgress::Done));
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/e1.mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 16])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let (downloader, engine, media) = setup(&server).await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let pending_before = engine.pending().unwrap().len();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cancel_tx.send(true);
        });

        let err = downloader.download("e1", None, cancel_rx).await.unwrap_err();
        assert!(matches!(err, PodsyncError::Cancelled));
        assert!(media.keys().await.unwrap().is_empty());
        assert_eq!(engine.pending().unwrap().len(), pending_before);
        let episode = engine
            .query(|tx| queries::get_episode_by_id(tx, "e1"))
            .unwrap()
            .unwrap();
        assert!(!episode.downloaded);
    }

    #[tokio::test]
    async fn test_unknown_episode() {
        let server = MockServer::start().await;
        let (downloader, _engine, _media) = setup(&server).await;
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let err = downloader.download("nope", None, cancel_rx).await.unwrap_err();
        assert!(matches!(err, PodsyncError::EpisodeNotFound(_)));
    }
}
