//! Error types for the request channel, credential renewal, the streaming
//! channel, and event reconciliation.

use std::path::PathBuf;

use tokio_tungstenite::tungstenite;

/// Why a credential renewal did not produce a fresh pair.
///
/// Cloned into every request that was queued behind the failed renewal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalError {
    #[error("no renewal credential stored")]
    MissingRenewalCredential,

    #[error("renewal rejected with status {status}")]
    Rejected { status: u16 },

    #[error("renewal request failed: {0}")]
    Transport(String),

    #[error("malformed renewal response: {0}")]
    Decode(String),

    #[error("renewed credentials could not be stored: {0}")]
    Store(String),

    #[error("renewal abandoned before completion")]
    Abandoned,
}

/// Failures surfaced by the request channel.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("authorization rejected")]
    Unauthorized,

    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request channel unavailable: {0}")]
    Transport(String),

    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Renewal(#[from] RenewalError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 => Self::Unauthorized,
            Some(status) => Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Transport(err.to_string()),
        }
    }

    /// True for failures that mean the access credential was not accepted.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Failures of the streaming channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("gave up after {attempts} reconnection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("streaming channel connect failed: {0}")]
    Connect(String),

    #[error("streaming channel is not connected")]
    NotConnected,

    #[error("failed to encode outbound frame: {0}")]
    Encode(String),
}

impl StreamError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                Self::Connect(format!("handshake rejected with status {}", response.status()))
            }
            other => Self::Connect(other.to_string()),
        }
    }
}

/// A consumer could not apply an event to its state.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{consumer} could not apply {event}: {reason}")]
    Apply {
        consumer: &'static str,
        event: String,
        reason: String,
    },
}

/// Invalid values in the layered configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("configuration could not be loaded: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Failures of the persistent credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
