//! Connection errors and their reconnect classification

use fleet_core::{CodecError, IpcError};
use thiserror::Error;

use crate::ack::AckError;
use crate::transport::TransportError;

/// How the gateway reacts to a failed connect sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry after the regular reconnect delay
    Short,
    /// Retry after the extended delay, a competing session is active
    Long,
    /// Nothing to connect, destroy the connection
    Remove,
}

/// Failure publishing a message
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure handling a backend command
#[derive(Debug, Error)]
pub enum CommandError {
    /// Counter is not the successor of the last handled command
    #[error("Command out of order: expected {expected}, got {received}")]
    OutOfOrder { expected: u64, received: u64 },

    #[error("Failed to pass command to module: {0}")]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Failure of the connect sequence
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No live devices and no outage logs for this endpoint
    #[error("No devices connected or pending in the outage log")]
    NoDevices,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connect sequence timed out: {0}")]
    Timeout(String),

    #[error("Backend answered with session {received}, expected {expected}")]
    BadSessionId { expected: String, received: String },

    #[error("Car {0} already has an active session")]
    AlreadyLogged(String),

    /// The channel kept yielding empty receives
    #[error("Channel stalled after {0} empty receives")]
    ChannelStalled(u32),

    #[error("Unexpected {received} while waiting for {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    UnmatchedAck(#[from] AckError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Module IPC failed: {0}")]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Send(#[from] SendError),
}

impl ConnectError {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        match self {
            ConnectError::NoDevices => ReconnectPolicy::Remove,
            ConnectError::AlreadyLogged(_) => ReconnectPolicy::Long,
            _ => ReconnectPolicy::Short,
        }
    }
}
