use std::process::{Command, Stdio};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use podsync::app::AppContext;
use podsync::cli::{commands, Cli, Commands, DaemonAction};
use podsync::config::{parse_interval, Config};
use podsync::scheduler::{daemon_status, log_filter, log_writer, stop_daemon, Daemon, DaemonConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Daemon {
            action:
                DaemonAction::Start {
                    log: Some(path),
                    foreground: true,
                    ..
                },
        } => tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(log_writer(path)?))
            .with(log_filter())
            .init(),
        Commands::Daemon {
            action: DaemonAction::Start {
                foreground: true, ..
            },
        } => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(log_filter())
            .init(),
        _ => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init(),
    }

    // Daemon control doesn't need the databases.
    if let Commands::Daemon { action } = &cli.command {
        match action {
            DaemonAction::Stop => {
                stop_daemon().map_err(anyhow::Error::msg)?;
                println!("Daemon stopped");
                return Ok(());
            }
            DaemonAction::Status => {
                println!("{}", daemon_status());
                return Ok(());
            }
            DaemonAction::Start {
                interval,
                log,
                foreground: false,
            } => {
                let mut cmd = Command::new(std::env::current_exe()?);
                if let Some(config) = &cli.config {
                    cmd.arg("--config").arg(config);
                }
                cmd.args(["daemon", "start", "--foreground"]);
                if let Some(interval) = interval {
                    cmd.arg("--interval").arg(interval);
                }
                if let Some(log) = log {
                    cmd.arg("--log").arg(log);
                }
                let child = cmd
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
                println!("Daemon started (PID: {})", child.id());
                return Ok(());
            }
            DaemonAction::Start { .. } => {}
        }
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let ctx = AppContext::open(config)?;

    match cli.command {
        Commands::Search { query } => commands::search(&ctx, &query).await?,
        Commands::Trending => commands::trending(&ctx).await?,
        Commands::Add { feed_id } => commands::add_feed(&ctx, &feed_id).await?,
        Commands::Subscribe { feed_id } => commands::subscribe(&ctx, &feed_id).await?,
        Commands::Unsubscribe { feed_id } => commands::unsubscribe(&ctx, &feed_id)?,
        Commands::Remove { feed_id } => commands::remove_feed(&ctx, &feed_id).await?,
        Commands::List {
            subscribed,
            searched,
        } => commands::list_feeds(&ctx, subscribed, searched)?,
        Commands::Episodes { feed_id, limit } => commands::list_episodes(&ctx, &feed_id, limit)?,
        Commands::Progress {
            episode_id,
            seconds,
            played,
        } => commands::record_progress(&ctx, &episode_id, seconds, played)?,
        Commands::Play { episode_id } => commands::play(&ctx, &episode_id)?,
        Commands::Download { episode_id } => commands::download(&ctx, &episode_id).await?,
        Commands::Sweep => commands::sweep(&ctx).await?,
        Commands::Sync => commands::sync(&ctx).await?,
        Commands::Daemon {
            action: DaemonAction::Start { interval, .. },
        } => {
            let ctx = Arc::new(ctx);
            let mut daemon_config = DaemonConfig::from_context(&ctx);
            if let Some(interval) = interval {
                daemon_config.sweep_interval = parse_interval(&interval).map_err(anyhow::Error::msg)?;
            }
            Daemon::new(ctx, daemon_config).run().await?;
            return Ok(());
        }
        Commands::Daemon { .. } => {}
    }

    commands::flush(&ctx).await;
    ctx.close();
    Ok(())
}
