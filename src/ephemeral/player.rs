use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::app::{PodsyncError, Result};
use crate::domain::Episode;
use crate::ephemeral::Observable;
use crate::mutation::queries;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerState {
    pub playing: bool,
    pub episode_id: Option<String>,
    /// Seconds into the loaded episode.
    pub position: f64,
}

/// Transport controls. Only the choice of episode and reported progress
/// reach the cache; play/pause stay local.
pub struct Player {
    engine: Arc<SyncEngine>,
    state: Observable<PlayerState>,
}

impl Player {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            state: Observable::default(),
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    /// Resume the loaded episode. Does nothing when none is loaded.
    pub fn play(&self) {
        self.state.update(|s| s.playing = s.episode_id.is_some());
    }

    pub fn pause(&self) {
        self.state.update(|s| s.playing = false);
    }

    pub fn toggle(&self) {
        if self.state.get().playing {
            self.pause();
        } else {
            self.play();
        }
    }

    /// Load and start an episode. Video enclosures are not played and
    /// return `Ok(false)`.
    pub fn play_episode(&self, episode_id: &str) -> Result<bool> {
        let (episode, current) = self.engine.query(|tx| {
            Ok((
                queries::get_episode_by_id(tx, episode_id)?,
                queries::get_current_episode_id(tx)?,
            ))
        })?;
        let episode: Episode =
            episode.ok_or_else(|| PodsyncError::EpisodeNotFound(episode_id.to_string()))?;

        if episode.is_video() {
            info!(episode_id, enclosure_type = %episode.enclosure_type, "Skipping video episode");
            return Ok(false);
        }

        if current.as_deref() != Some(episode_id) {
            self.engine.mutate().set_current_episode(episode_id)?;
        }
        self.engine
            .mutate()
            .update_feed_last_accessed_at(&episode.feed_id)?;

        self.state.set(PlayerState {
            playing: true,
            episode_id: Some(episode.id.clone()),
            position: episode.current_time,
        });
        debug!(episode_id, position = episode.current_time, "Playing episode");
        Ok(true)
    }

    /// Record the playhead and persist it as the episode's progress.
    pub fn report_progress(&self, position: f64, played: Option<bool>) -> Result<()> {
        let Some(episode_id) = self.state.get().episode_id else {
            return Ok(());
        };
        self.state.update(|s| s.position = position);
        self.engine
            .mutate()
            .update_progress_for_episode(&episode_id, position, played)?;
        Ok(())
    }
}
