pub mod episode;
pub mod feed;
pub mod keys;
pub mod pending;

pub use episode::{format_duration, ApiEpisode, Episode, EpisodeUpdate};
pub use feed::{ApiFeed, Feed, FeedUpdate};
pub use pending::PendingMutation;
