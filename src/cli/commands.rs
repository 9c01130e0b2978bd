use std::io::Write;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::app::{AppContext, PodsyncError, Result};
use crate::domain::{ApiFeed, Feed};
use crate::media::DownloadProgress;
use crate::mutation::queries;

fn print_api_feeds(feeds: &[ApiFeed]) {
    if feeds.is_empty() {
        println!("No podcasts found");
        return;
    }
    for feed in feeds {
        println!("{:>10}  {}", feed.id, feed.title);
        if !feed.author.is_empty() {
            println!("            by {}", feed.author);
        }
    }
}

/// Search the directory and cache the results as search feeds.
pub async fn search(ctx: &AppContext, query: &str) -> Result<()> {
    let feeds = ctx.directory.search_by_term(query).await?;
    if !feeds.is_empty() {
        ctx.engine.mutate().add_feeds(feeds.clone(), true)?;
    }
    print_api_feeds(&feeds);
    Ok(())
}

pub async fn trending(ctx: &AppContext) -> Result<()> {
    let feeds = ctx.directory.trending().await?;
    if !feeds.is_empty() {
        ctx.engine.mutate().add_feeds(feeds.clone(), true)?;
    }
    print_api_feeds(&feeds);
    Ok(())
}

/// Fetch a feed and its episodes from the directory into the cache.
async fn fetch_feed(ctx: &AppContext, feed_id: &str) -> Result<Feed> {
    let api_feed = ctx.directory.podcast_by_id(feed_id).await?;
    let episodes = ctx.directory.episodes_by_podcast_id(feed_id).await?;
    let count = episodes.len();

    let mutate = ctx.engine.mutate();
    mutate.add_feed(api_feed, false)?;
    mutate.add_episodes_for_feed(episodes)?;

    let feed = ctx
        .engine
        .query(|tx| queries::get_feed(tx, feed_id))?
        .ok_or_else(|| PodsyncError::FeedNotFound(feed_id.to_string()))?;
    println!("Added {} ({} episodes)", feed.display_title(), count);
    Ok(feed)
}

pub async fn add_feed(ctx: &AppContext, feed_id: &str) -> Result<()> {
    fetch_feed(ctx, feed_id).await?;
    Ok(())
}

pub async fn subscribe(ctx: &AppContext, feed_id: &str) -> Result<()> {
    let cached = ctx.engine.query(|tx| queries::get_feed(tx, feed_id))?;
    let feed = match cached {
        Some(feed) if !feed.from_search => feed,
        _ => fetch_feed(ctx, feed_id).await?,
    };
    ctx.engine.mutate().subscribe_to_feed(feed_id)?;
    println!("Subscribed to {}", feed.display_title());
    Ok(())
}

pub fn unsubscribe(ctx: &AppContext, feed_id: &str) -> Result<()> {
    ctx.engine.mutate().unsubscribe_from_feed(feed_id)?;
    println!("Unsubscribed from {}", feed_id);
    Ok(())
}

pub async fn remove_feed(ctx: &AppContext, feed_id: &str) -> Result<()> {
    let (feed, episodes) = ctx.engine.query(|tx| {
        Ok((
            queries::get_feed(tx, feed_id)?,
            queries::list_episodes_for_feed(tx, feed_id)?,
        ))
    })?;
    let feed = feed.ok_or_else(|| PodsyncError::FeedNotFound(feed_id.to_string()))?;

    ctx.engine.mutate().delete_feed(feed_id)?;
    ctx.engine.mutate().delete_episodes_for_feed(feed_id)?;
    let mut removed = 0;
    for episode in &episodes {
        if ctx.media.delete(&episode.id).await? {
            removed += 1;
        }
    }

    println!(
        "Removed {} ({} episodes, {} downloads)",
        feed.display_title(),
        episodes.len(),
        removed
    );
    Ok(())
}

pub fn list_feeds(ctx: &AppContext, subscribed: bool, searched: bool) -> Result<()> {
    let feeds = ctx.engine.query(|tx| {
        if subscribed {
            queries::list_subscribed_feeds(tx)
        } else if searched {
            queries::list_searched_feeds(tx)
        } else {
            queries::list_regular_feeds(tx)
        }
    })?;

    if feeds.is_empty() {
        println!("No podcasts");
        return Ok(());
    }

    for feed in feeds {
        let marker = if feed.subscribed { "*" } else { " " };
        println!(
            "{} {:>10}  {}\n              updated {}",
            marker,
            feed.id,
            feed.display_title(),
            feed.last_updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub fn list_episodes(ctx: &AppContext, feed_id: &str, limit: usize) -> Result<()> {
    let (current, episodes) = ctx.engine.query(|tx| {
        Ok((
            queries::get_current_episode_id(tx)?,
            queries::list_episodes_for_feed(tx, feed_id)?,
        ))
    })?;

    if episodes.is_empty() {
        println!("No episodes");
        return Ok(());
    }

    for episode in episodes.iter().take(limit) {
        let marker = if current.as_deref() == Some(episode.id.as_str()) {
            ">"
        } else if episode.played {
            "✓"
        } else if episode.downloaded {
            "↓"
        } else {
            " "
        };
        println!(
            "{} {} {:>8}  {}  [{}]",
            marker,
            episode.date_published.format("%Y-%m-%d"),
            episode.duration_formatted,
            episode.display_title(),
            episode.id
        );
    }
    Ok(())
}

pub fn record_progress(ctx: &AppContext, episode_id: &str, seconds: f64, played: bool) -> Result<()> {
    let exists = ctx
        .engine
        .query(|tx| queries::get_episode_by_id(tx, episode_id))?
        .is_some();
    if !exists {
        return Err(PodsyncError::EpisodeNotFound(episode_id.to_string()));
    }
    ctx.engine
        .mutate()
        .update_progress_for_episode(episode_id, seconds, played.then_some(true))?;
    println!("Saved position {:.0}s for {}", seconds, episode_id);
    Ok(())
}

pub fn play(ctx: &AppContext, episode_id: &str) -> Result<()> {
    if ctx.player.play_episode(episode_id)? {
        let state = ctx.player.state();
        println!("Now playing {} from {:.0}s", episode_id, state.position);
    } else {
        println!("{} is a video episode; skipped", episode_id);
    }
    Ok(())
}

/// Download with a progress line; Ctrl+C cancels cleanly.
pub async fn download(ctx: &AppContext, episode_id: &str) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (progress_tx, mut progress_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            match update {
                DownloadProgress::Percent(p) => print!("\r  {:>3}%", p),
                DownloadProgress::Bytes(n) => print!("\r  {} KiB", n / 1024),
                DownloadProgress::Done => print!("\r      \r"),
            }
            let _ = std::io::stdout().flush();
        }
    });

    let result = ctx
        .downloader
        .download(episode_id, Some(progress_tx), cancel_rx)
        .await;
    let _ = printer.await;

    match result {
        Ok(blob) => {
            println!("Downloaded {} ({} KiB)", episode_id, blob.len() / 1024);
            Ok(())
        }
        Err(PodsyncError::Cancelled) => {
            println!("\nDownload cancelled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn sweep(ctx: &AppContext) -> Result<()> {
    let report = ctx.scheduler.run_cycle(Utc::now()).await?;
    if report.skipped {
        println!("A sweep is already running");
        return Ok(());
    }
    println!(
        "Sweep complete: {} refreshed, {} failed, {} feeds deleted, {} downloads evicted, {} orphans removed",
        report.refreshed,
        report.refresh_failed,
        report.deleted_feeds,
        report.evicted_media,
        report.orphans_removed
    );
    Ok(())
}

pub async fn sync(ctx: &AppContext) -> Result<()> {
    let report = ctx.engine.sync_once().await?;
    let status = ctx.engine.status()?;
    println!(
        "Pushed {}, acknowledged {}, {} keys changed, {} pending",
        report.pushed,
        report.acknowledged,
        report.changed.len(),
        status.pending
    );
    Ok(())
}

/// Best-effort push and pull after a command that changed local state.
pub async fn flush(ctx: &AppContext) {
    let pending = ctx.engine.pending().map(|p| p.len()).unwrap_or(0);
    if pending == 0 {
        return;
    }
    if let Err(e) = ctx.engine.sync_once().await {
        eprintln!("Sync deferred ({} changes pending): {}", pending, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{api_episode, api_feed};

    #[tokio::test]
    async fn test_remove_feed_cascades() {
        let ctx = AppContext::in_memory().unwrap();
        ctx.engine.mutate().add_feed(api_feed("f1", "Syntax"), false).unwrap();
        ctx.engine
            .mutate()
            .add_episodes_for_feed(vec![api_episode("e1", "f1", 60)])
            .unwrap();
        ctx.media
            .put("e1", crate::media::MediaBlob::new("audio/mpeg", vec![1]))
            .await
            .unwrap();

        remove_feed(&ctx, "f1").await.unwrap();
        ctx.engine
            .query(|tx| {
                assert!(queries::get_feed(tx, "f1")?.is_none());
                assert!(queries::list_episodes_for_feed(tx, "f1")?.is_empty());
                Ok(())
            })
            .unwrap();
        assert!(ctx.media.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_drains_outbox() {
        let ctx = AppContext::in_memory().unwrap();
        ctx.engine.mutate().set_player_speed(1.25).unwrap();
        flush(&ctx).await;
        assert!(ctx.engine.pending().unwrap().is_empty());
    }

    #[test]
    fn test_progress_for_unknown_episode() {
        let ctx = AppContext::in_memory().unwrap();
        assert!(matches!(
            record_progress(&ctx, "nope", 1.0, false),
            Err(PodsyncError::EpisodeNotFound(_))
        ));
    }
}
