//! Common error types

use thiserror::Error;

/// Errors raised while turning messages into bytes and back
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors raised by the module subsystem IPC
#[derive(Debug, Error)]
pub enum IpcError {
    /// IPC link could not be established
    #[error("IPC connection failed: {0}")]
    ConnectionFailed(String),

    /// IPC link is gone
    #[error("IPC connection closed")]
    ConnectionClosed,

    /// Request could not be published
    #[error("IPC send failed: {0}")]
    SendFailed(String),

    /// No answer within the request timeout
    #[error("IPC request timed out: {0}")]
    Timeout(String),

    /// Reply could not be interpreted
    #[error("Malformed IPC message: {0}")]
    Malformed(String),

    /// The module subsystem does not know the requested item
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
