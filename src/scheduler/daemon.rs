//! Long-running background process.
//!
//! Runs the sync loop and the staleness scheduler side by side until
//! SIGTERM/SIGINT, guarded by a PID file so only one instance runs. Its
//! output is the regular tracing stream, optionally redirected to a file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::{AppContext, PodsyncError, Result};
use crate::config::format_interval;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub sweep_interval: Duration,
    pub sync_interval: Duration,
}

impl DaemonConfig {
    pub fn from_context(ctx: &AppContext) -> Self {
        Self {
            sweep_interval: ctx.config.scheduler.interval,
            sync_interval: ctx.config.sync.poll_interval,
        }
    }
}

pub struct Daemon {
    ctx: Arc<AppContext>,
    config: DaemonConfig,
}

impl Daemon {
    pub fn new(ctx: Arc<AppContext>, config: DaemonConfig) -> Self {
        Self { ctx, config }
    }

    pub fn pid_file_path() -> Option<PathBuf> {
        dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .map(|d| d.join("podsync").join("daemon.pid"))
    }

    fn running_pid() -> Option<u32> {
        let pid_path = Self::pid_file_path()?;
        let pid: u32 = fs::read_to_string(pid_path).ok()?.trim().parse().ok()?;
        Self::process_exists(pid).then_some(pid)
    }

    pub fn is_running() -> bool {
        Self::running_pid().is_some()
    }

    #[cfg(unix)]
    fn process_exists(pid: u32) -> bool {
        use std::process::Command;
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    fn process_exists(pid: u32) -> bool {
        use std::process::Command;
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    fn write_pid_file(&self) -> std::io::Result<()> {
        if let Some(pid_path) = Self::pid_file_path() {
            if let Some(parent) = pid_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&pid_path)?;
            writeln!(file, "{}", std::process::id())?;
        }
        Ok(())
    }

    fn remove_pid_file(&self) {
        if let Some(pid_path) = Self::pid_file_path() {
            let _ = fs::remove_file(pid_path);
        }
    }

    /// Run until a termination signal arrives.
    pub async fn run(&self) -> Result<()> {
        if Self::is_running() {
            return Err(PodsyncError::Other(
                "Another daemon instance is already running".to_string(),
            ));
        }
        self.write_pid_file()
            .map_err(|e| PodsyncError::Other(format!("Failed to write PID file: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_signal_handler(shutdown_tx)?;

        info!(
            sweep_every = %format_interval(self.config.sweep_interval),
            sync_every = %format_interval(self.config.sync_interval),
            pid = std::process::id(),
            "podsync daemon started"
        );

        let engine = self.ctx.engine.clone();
        let sync_rx = shutdown_rx.clone();
        let sync_interval = self.config.sync_interval;
        let sync_loop = tokio::spawn(async move { engine.run(sync_interval, sync_rx).await });

        let scheduler = self.ctx.scheduler.clone();
        let sweep_interval = self.config.sweep_interval;
        let sweep_loop =
            tokio::spawn(async move { scheduler.run(sweep_interval, shutdown_rx).await });

        let (sync_result, sweep_result) = tokio::join!(sync_loop, sweep_loop);
        if let Err(e) = sync_result {
            error!(error = %e, "Sync loop ended abnormally");
        }
        if let Err(e) = sweep_result {
            error!(error = %e, "Scheduler ended abnormally");
        }

        info!("Daemon shutting down");
        if let Err(e) = self.ctx.engine.push().await {
            warn!(error = %e, "Final push failed, outbox kept");
        }
        self.ctx.close();
        self.remove_pid_file();
        Ok(())
    }
}

/// Append-only destination for the daemon's `--log` file.
pub fn log_writer(path: &Path) -> std::io::Result<Mutex<fs::File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Mutex::new(file))
}

/// `RUST_LOG` when set, otherwise info-level events from this crate.
pub fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("podsync=info"))
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {},
                _ = sigint.recv() => {},
            }
            let _ = shutdown.send(true);
        });
    }

    #[cfg(windows)]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown.send(true);
        });
    }

    Ok(())
}

/// Stop a running daemon by reading its PID file and signalling it.
pub fn stop_daemon() -> std::result::Result<(), String> {
    let pid_path =
        Daemon::pid_file_path().ok_or_else(|| "Could not determine PID file path".to_string())?;

    if !pid_path.exists() {
        return Err("No daemon is running (PID file not found)".to_string());
    }

    let pid_str =
        fs::read_to_string(&pid_path).map_err(|e| format!("Failed to read PID file: {}", e))?;
    let pid: u32 = pid_str
        .trim()
        .parse()
        .map_err(|_| "Invalid PID in PID file".to_string())?;

    #[cfg(unix)]
    let status = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .map_err(|e| format!("Failed to send signal: {}", e))?;

    #[cfg(windows)]
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()
        .map_err(|e| format!("Failed to stop process: {}", e))?;

    if status.success() {
        let _ = fs::remove_file(&pid_path);
        Ok(())
    } else {
        Err(format!("Failed to stop daemon (PID {})", pid))
    }
}

pub fn daemon_status() -> String {
    match Daemon::running_pid() {
        Some(pid) => format!("Daemon is running (PID: {})", pid),
        None => match Daemon::pid_file_path() {
            Some(path) if path.exists() => "Daemon is not running (stale PID file)".to_string(),
            _ => "Daemon is not running".to_string(),
        },
    }
}
