use std::time::Duration;
use thiserror::Error;

/// Failure of a single `send_message` call. None of these are retried internally.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("completion endpoint returned HTTP {status} {status_text}: {body}")]
    UpstreamHttp {
        status: u16,
        status_text: String,
        body: String,
    },

    #[error("completion response carried no usable choice: {0}")]
    UpstreamPayload(String),

    #[error("failed to parse stream event {data:?}: {source}")]
    StreamParse {
        data: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("token counting failed: {0}")]
    Tokenizer(String),
}

impl ClientError {
    /// True for the two ways a call can be stopped from outside.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ClientError::Timeout(_) | ClientError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(String),

    #[error("store lookup for {0} timed out")]
    Timeout(String),

    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Lookup failures that the history walk treats as an absent parent.
    pub fn is_miss(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
