use thiserror::Error;

#[derive(Error, Debug)]
pub enum PodsyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("Unknown mutation: {0}")]
    UnknownMutation(String),

    #[error("Mutation {name} already registered")]
    DuplicateMutation { name: String },

    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArgs { name: String, reason: String },

    #[error("Directory API error: {0}")]
    Directory(String),

    #[error("Sync channel error: {0}")]
    Sync(String),

    #[error("{label} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        #[source]
        source: Box<PodsyncError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cache is closed")]
    Closed,

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl PodsyncError {
    /// Whether a retry wrapper should try the failed operation again.
    ///
    /// Remote and transport failures are retryable. Errors that describe the
    /// request or a body that cannot be decoded are not.
    pub fn is_transient(&self) -> bool {
        match self {
            PodsyncError::Http(e) if e.is_decode() || e.is_builder() => false,
            PodsyncError::Http(e) => match e.status() {
                Some(status) => status.is_server_error() || status.as_u16() == 429,
                None => true,
            },
            PodsyncError::Directory(_) | PodsyncError::Sync(_) => true,
            PodsyncError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PodsyncError>;

/// Lock a std mutex, surfacing poisoning as an error instead of panicking.
pub(crate) fn lock<'a, T>(
    mutex: &'a std::sync::Mutex<T>,
    what: &str,
) -> Result<std::sync::MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|e| PodsyncError::LockPoisoned(format!("{}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_are_not_retryable() {
        assert!(!PodsyncError::FeedNotFound("f1".into()).is_transient());
        assert!(!PodsyncError::Cancelled.is_transient());
        assert!(!PodsyncError::UnknownMutation("nope".into()).is_transient());
    }

    #[test]
    fn test_decode_errors_are_not_retryable() {
        let err = serde_json::from_str::<u64>("{not json").unwrap_err();
        assert!(!PodsyncError::from(err).is_transient());
    }

    #[test]
    fn test_remote_errors_are_retryable() {
        assert!(PodsyncError::Directory("status false".into()).is_transient());
        assert!(PodsyncError::Sync("connection reset".into()).is_transient());
    }

    #[test]
    fn test_exhausted_message_includes_source() {
        let err = PodsyncError::RetriesExhausted {
            label: "refresh 42".into(),
            attempts: 3,
            source: Box::new(PodsyncError::Directory("boom".into())),
        };
        assert_eq!(
            err.to_string(),
            "refresh 42 failed after 3 attempts: Directory API error: boom"
        );
    }
}
