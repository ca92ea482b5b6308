//! Error taxonomy for registry fetches and measurement sub-tests.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Registry (or user info endpoint) unreachable, or answered non-2xx.
    #[error("failed to retrieve server list from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse server list: {0}")]
    Parse(String),

    #[error("registry returned no servers")]
    EmptyResult,

    /// Not a single socket could be opened for a sub-test.
    #[error("unable to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    /// Every probe attempt in a loop went unanswered.
    #[error("no response from {host} after {attempts} attempts")]
    NoResponse { host: String, attempts: u32 },

    #[error("no tested servers to average")]
    NoResults,

    /// HTTP fallback transport failure.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("measurement cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn connect(host: &str, reason: impl std::fmt::Display) -> Self {
        Error::Connect {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}
