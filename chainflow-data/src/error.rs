use crate::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors generated while authorizing, connecting to, or talking over the broker feed.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum FeedError {
    #[error("feed authorization rejected: re-authentication required")]
    AuthRequired,

    #[error("feed authorization failed: {0}")]
    Authorization(String),

    #[error("feed transport error: {0}")]
    Transport(String),

    #[error("feed connection closed by remote")]
    ConnectionClosed,

    #[error("no feed data received for {idle_secs}s")]
    ReadTimeout { idle_secs: u64 },

    #[error("feed client is not connected")]
    NotConnected,

    #[error("failed to encode feed control message: {0}")]
    Encode(String),
}

impl FeedError {
    /// Determine if the error can only be resolved by the caller supplying a fresh access token.
    ///
    /// The feed client never refreshes credentials itself.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, FeedError::AuthRequired)
    }

    /// Determine if an error requires the feed connection to be torn down and re-established.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::ConnectionClosed
            | FeedError::NotConnected
            | FeedError::ReadTimeout { .. } => true,
            FeedError::Transport(error_msg) => {
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("closed")
                    || error_lower.contains("reset")
                    || error_lower.contains("io(")
                    || error_lower.contains("timeout")
                    || error_lower.contains("protocol")
            }
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(value: reqwest::Error) -> Self {
        Self::Authorization(value.to_string())
    }
}

/// Errors generated while decoding a binary feed frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed feed frame: {0}")]
    Malformed(#[from] prost::DecodeError),
}

/// Errors generated while routing a [`Tick`](crate::Tick) to market state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum RouteError {
    #[error("unresolvable instrument key: {0}")]
    Unresolved(InstrumentKey),
}

/// Errors generated while loading or validating configuration and reference data.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
