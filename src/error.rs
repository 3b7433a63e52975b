//! Error types shared by the settings client, the request batcher and the
//! loading counter.
//!
//! Every error is `Clone`: a single failed flush is delivered to each future
//! whose change rode along with it, so the error has to be handed out more
//! than once.

use std::sync::Arc;

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A read of an undeclared key without a fallback
    #[error(
        "Unexpected `get(\"{key}\")` call on unrecognized setting \"{key}\". Setting an initial \
         value via `set(\"{key}\", value)` before reading it, or calling \
         `get_or(\"{key}\", fallback)`, may fix this issue."
    )]
    UnknownSetting { key: String },

    /// A write to a key whose value is locked by the server
    #[error("Unable to update \"{key}\" because its value is overridden by the server")]
    OverriddenSetting { key: String },

    /// The write request carrying this change failed
    #[error(transparent)]
    NetworkWrite(#[from] NetworkWriteError),

    /// A `json` setting holds a string that isn't valid JSON
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// A `number` setting holds something that doesn't parse as a finite float
    #[error("invalid number: {0:?}")]
    InvalidNumber(String),

    /// A loading count source reported a negative count
    #[error("loading count sources must only report non-negative counts, got {0}")]
    NegativeLoadingCount(i64),

    /// Client configuration could not be loaded
    #[error(transparent)]
    Config(Arc<config::ConfigError>),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkWriteError {
    /// The server answered with a 3xx or higher status
    #[error("Request failed with status code: {0}")]
    Status(u16),

    /// The transport failed before a response arrived
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered 2xx with a body that isn't a settings snapshot
    #[error("Invalid response body: {0}")]
    Decode(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(Arc::new(err))
    }
}

impl Error {
    /// True if this error came from the network write path rather than from
    /// local validation.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::NetworkWrite(..))
    }
}
