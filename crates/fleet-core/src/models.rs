//! Value types describing endpoints, devices and their traffic

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a module (a group of device types sharing business rules)
pub type ModuleId = u32;

/// Network identity of one backend server instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address
    pub address: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A physical device attached to the vehicle
///
/// Two devices with identical fields are the same logical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    /// Owning module
    pub module: ModuleId,
    /// Module-specific device type
    pub device_type: u32,
    /// Role of the device within the vehicle (e.g., "left_button")
    pub device_role: String,
    /// Human-readable device name
    pub device_name: String,
}

impl Device {
    pub fn new(
        module: ModuleId,
        device_type: u32,
        device_role: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            module,
            device_type,
            device_role: device_role.into(),
            device_name: device_name.into(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} [{}]",
            self.device_name, self.device_role, self.module
        )
    }
}

/// Status reported by a device, payload opaque to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: Device,
    #[serde(with = "crate::serde_hex")]
    pub status_data: Vec<u8>,
}

impl DeviceStatus {
    pub fn new(device: Device, status_data: impl Into<Vec<u8>>) -> Self {
        Self {
            device,
            status_data: status_data.into(),
        }
    }
}

/// Command addressed to a device, payload opaque to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub device: Device,
    #[serde(with = "crate::serde_hex")]
    pub command_data: Vec<u8>,
}

impl DeviceCommand {
    pub fn new(device: Device, command_data: impl Into<Vec<u8>>) -> Self {
        Self {
            device,
            command_data: command_data.into(),
        }
    }
}
