//! Errors surfaced by the connection multiplexer.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while connecting to, or streaming from, the upstream feed.
///
/// Transport-level failures are delivered to subscribers through
/// [`TickHandler::on_error`](super::TickHandler::on_error); only `connect()`
/// returns them directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// `connect()` was called while an attempt is already connecting or
    /// awaiting authentication. Await the existing attempt instead.
    #[error("Connection already in progress")]
    ConnectionInProgress,

    /// The server rejected the credential. Not retried automatically.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The transport did not open and authenticate within the bound.
    #[error("Authentication not confirmed within {0:?}")]
    AuthenticationTimeout(Duration),

    /// Socket-level failure (connect refused, read/write error, abrupt close).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A pending `connect()` was aborted by an explicit `disconnect()`.
    #[error("Disconnected by caller")]
    Disconnected,
}

impl FeedError {
    /// Whether an unexpected close caused by this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Transport(_) | FeedError::AuthenticationTimeout(_) | FeedError::Protocol(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Protocol(err.to_string())
    }
}
