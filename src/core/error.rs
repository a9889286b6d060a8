//! Error taxonomy shared by the venue adapters, the store, and the loop.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Network, timeout or rate-limit trouble. Retryable with backoff at the
    /// adapter layer only; the loop skips the action for this cycle.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// The venue refused the order (bad params, insufficient balance).
    /// Never retried automatically.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Quote or market data temporarily unobtainable. Skip the pair this cycle.
    #[error("venue unavailable: {0}")]
    Unavailable(String),

    /// Live backend feature not yet wired. Fails loudly at the call site.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Configuration errors. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted or remote value that should be impossible.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return Error::Transient(e.to_string());
        }
        if let Some(status) = e.status() {
            if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Error::Rejected(e.to_string());
            }
        }
        Error::Transient(e.to_string())
    }
}
