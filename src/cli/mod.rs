pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "podsync")]
#[command(about = "A local-first podcast client", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/podsync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search the podcast directory
    Search {
        /// Search terms
        query: String,
    },
    /// Show trending podcasts
    Trending,
    /// Add a podcast and its episodes by directory id
    Add {
        feed_id: String,
    },
    /// Subscribe to a podcast, adding it first if needed
    Subscribe {
        feed_id: String,
    },
    /// Unsubscribe from a podcast
    Unsubscribe {
        feed_id: String,
    },
    /// Remove a podcast, its episodes and downloads
    Remove {
        feed_id: String,
    },
    /// List cached podcasts
    List {
        /// Only subscribed podcasts
        #[arg(long)]
        subscribed: bool,
        /// Only podcasts cached from search results
        #[arg(long, conflicts_with = "subscribed")]
        searched: bool,
    },
    /// List a podcast's episodes, newest first
    Episodes {
        feed_id: String,
        /// Show at most this many
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Record playback progress for an episode
    Progress {
        episode_id: String,
        /// Position in seconds
        seconds: f64,
        /// Mark the episode as played
        #[arg(long)]
        played: bool,
    },
    /// Play an episode (updates the current episode)
    Play {
        episode_id: String,
    },
    /// Download an episode for offline listening (Ctrl+C cancels)
    Download {
        episode_id: String,
    },
    /// Run one staleness sweep now
    Sweep,
    /// Push pending changes and pull the latest state
    Sync,
    /// Background daemon for sync and upkeep
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Start the background daemon
    Start {
        /// Sweep interval (e.g., "5m", "1h"), overriding the config
        #[arg(short, long)]
        interval: Option<String>,

        /// Log file path (default: stdout)
        #[arg(short, long)]
        log: Option<PathBuf>,

        /// Run in foreground (don't detach)
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Check daemon status
    Status,
}
