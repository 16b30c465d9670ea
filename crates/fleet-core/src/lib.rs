//! fleet-core - Core types and wire schema for the fleet gateway
//!
//! This crate provides the value types shared by the gateway's protocol
//! engine and its collaborators:
//!
//! - [`models`]: endpoints, devices, device statuses and commands
//! - [`protocol`]: messages exchanged with the fleet-management backend
//! - [`codec`]: byte encoding of protocol and IPC payloads
//! - [`ipc`]: the module subsystem collaborator trait

pub mod codec;
pub mod error;
pub mod ipc;
pub mod models;
pub mod protocol;

mod serde_hex;

pub use error::{CodecError, IpcError};
pub use ipc::ModuleIpc;
pub use models::{Device, DeviceCommand, DeviceStatus, Endpoint, ModuleId};
pub use protocol::{
    ClientMessage, Command, CommandResponse, CommandResponseType, Connect, ConnectResponse,
    ConnectResponseType, DeviceState, ServerMessage, Status, StatusResponse,
};
