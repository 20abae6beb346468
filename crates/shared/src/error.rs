//! Error types for the relay

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Send buffer full for client {0}")]
    SendBufferFull(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Dispatcher is not running")]
    DispatcherClosed,

    #[error("Handler error: {0}")]
    Handler(String),
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
