use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the data system.
///
/// Only configuration errors and connection-setup errors are returned to callers. Errors that
/// happen while a synchronizer is running are turned into status updates and log messages.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The data system configuration is invalid, e.g. a secondary synchronizer without a primary.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A base URI could not be turned into a request URL.
    #[error("invalid base URI")]
    InvalidBaseUri(#[source] url::ParseError),

    /// The server answered with a non-success HTTP status.
    #[error("HTTP error {0}")]
    HttpStatus(u16),

    /// A response or event body could not be decoded.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// A change set was completed or extended before any server intent was received.
    #[error("changeset: cannot complete without a server-intent")]
    NoServerIntent,

    /// The component cannot act as an initializer.
    #[error("{0} does not implement the fetch capability")]
    FetchNotSupported(&'static str),

    /// The persistent store failed.
    #[error("data store error: {0}")]
    Store(String),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedData(value.to_string())
    }
}
