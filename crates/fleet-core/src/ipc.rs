//! Module subsystem collaborator
//!
//! The device-facing side of the gateway (connection arbitration and
//! per-module business logic) lives in another process. The protocol engine
//! only needs the three request/response operations below; inbound
//! "send status" and "device disconnected" notifications are delivered as
//! dispatcher events by the IPC implementation.

use async_trait::async_trait;

use crate::error::IpcError;
use crate::models::{Device, DeviceCommand, DeviceStatus, ModuleId};

/// Module subsystem interface
#[async_trait]
pub trait ModuleIpc: Send + Sync {
    /// List devices currently live for a module
    async fn get_all_devices(&self, module: ModuleId) -> Result<Vec<Device>, IpcError>;

    /// Fetch the most recent status a device reported
    async fn get_last_device_status(&self, device: &Device) -> Result<DeviceStatus, IpcError>;

    /// Hand a backend command to the owning module
    async fn pass_command(&self, command: &DeviceCommand) -> Result<(), IpcError>;

    /// Release the IPC link
    async fn stop(&self) {}
}
