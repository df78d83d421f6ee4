/// Error types for the pantry cache.
///
/// The hierarchy follows how failures are handled rather than where they
/// come from: transport failures are transient, authentication failures
/// end the session, merge conflicts skip a single record, and durable-store
/// failures degrade the cache to its volatile tier.
use thiserror::Error;

/// The main error type for cache, watch and lifecycle operations.
///
/// Errors are `Clone` because one watch error is delivered to every
/// subscriber of that watch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Network or connectivity failure. Never corrupts cache state.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote rejected the session's credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A record had a shape that cannot be normalized.
    #[error("Malformed record '{key}': {reason}")]
    MergeConflict {
        /// Key of the offending record
        key: String,
        /// Why the record was rejected
        reason: String,
    },

    /// Disk I/O failure in the durable tier.
    #[error("Durable store error: {0}")]
    DurableStore(String),

    /// Encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A cache key string was not `type:id`.
    #[error("Invalid cache key '{0}'")]
    InvalidKey(String),

    /// A lifecycle transition not allowed from the current phase.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Phase the coordinator was in
        from: String,
        /// Phase that was requested
        to: String,
    },

    /// The watch was cancelled before it produced a settled value.
    #[error("Watch cancelled")]
    WatchCancelled,

    /// No authenticated session is available for the requested operation.
    #[error("No active session: {0}")]
    SessionUnavailable(String),
}

impl CacheError {
    /// True for errors that should force the session to sign out.
    pub fn is_authentication(&self) -> bool {
        matches!(self, CacheError::Authentication(_))
    }

    /// True for errors that are worth retrying without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Transport(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::DurableStore(err.to_string())
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
