//! Sync error types.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur while talking to other devices or the server.
///
/// These never cross the [`crate::sync::SyncHook`] boundary: the hook logs
/// them and reports a plain success flag instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Sync is not configured
    #[error("Sync not configured. Add server_url to config.")]
    NotConfigured,
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("HTTP error: {0}")]
    HttpError(String),
    #[error("WebSocket error: {0}")]
    WebSocketError(String),
    #[error("Sync protocol error: {0}")]
    ProtocolError(String),
    /// The named host is not known to the network or server
    #[error("Host not found: {0}")]
    HostNotFound(String),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    /// The server answered with `success: false`
    #[error("Server rejected request: {0}")]
    Rejected(String),
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("CBOR error: {0}")]
    CborError(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            SyncError::ConnectionError(e.to_string())
        } else {
            SyncError::HttpError(e.to_string())
        }
    }
}
