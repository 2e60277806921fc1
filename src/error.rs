use thiserror::Error;

/// A failed read against the survey backend.
///
/// Every variant is terminal for a watcher: polling stops and the error is
/// reported once.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to '{url}' failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Backend returned HTTP {status} for '{url}'")]
    Status { url: String, status: u16 },

    #[error("Backend error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        FetchError::Malformed(msg.into())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WatchError {
    #[error("A survey id is required to start watching")]
    InvalidInput,
}
