//! Background upkeep: the staleness sweep and the daemon that drives it
//! alongside the sync loop.

pub mod daemon;
pub mod policy;
pub mod staleness;

pub use daemon::{daemon_status, log_filter, log_writer, stop_daemon, Daemon, DaemonConfig};
pub use policy::{CyclePlan, EpisodeState, FeedState, StalenessPolicy};
pub use staleness::{CyclePhase, CycleReport, StalenessScheduler};
