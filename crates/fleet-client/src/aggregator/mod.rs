//! Outage aggregation
//!
//! While an endpoint connection is down, device statuses destined for it
//! are recorded per device. On reconnect each device is re-announced with
//! its last recorded status plus a module-specific summary of everything
//! that happened during the outage.

mod modules;
mod registry;

pub use modules::{CarAccessoryAggregator, MissionAggregator, CAR_ACCESSORY_MODULE, MISSION_MODULE};
pub use registry::{AggregatorRegistry, ModuleAggregator};

use std::collections::{BTreeSet, HashMap};

use fleet_core::{Device, DeviceStatus};
use tracing::{debug, error};

/// Ordered statuses recorded for one device
#[derive(Debug, Default, Clone)]
pub struct DeviceLog {
    statuses: Vec<DeviceStatus>,
}

impl DeviceLog {
    pub fn push(&mut self, status: DeviceStatus) {
        self.statuses.push(status);
    }

    pub fn statuses(&self) -> &[DeviceStatus] {
        &self.statuses
    }

    pub fn last(&self) -> Option<&DeviceStatus> {
        self.statuses.last()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

/// Per-connection outage log
pub struct OutageAggregator {
    strategies: AggregatorRegistry,
    logs: HashMap<Device, DeviceLog>,
}

impl OutageAggregator {
    pub fn new(strategies: AggregatorRegistry) -> Self {
        debug!(modules = ?strategies.modules(), "Outage aggregator initialized");
        Self {
            strategies,
            logs: HashMap::new(),
        }
    }

    /// Append a status to its device's log
    ///
    /// Returns `false` when the device's module has no strategy, in which
    /// case nothing is recorded.
    pub fn record(&mut self, status: DeviceStatus) -> bool {
        if !self.strategies.contains(status.device.module) {
            debug!(device = %status.device, "Module not aggregated, dropping status");
            return false;
        }
        debug!(device = %status.device, "Recording status during outage");
        self.log_mut(&status.device).push(status);
        true
    }

    /// Get or create the log for a device
    pub fn log_mut(&mut self, device: &Device) -> &mut DeviceLog {
        self.logs.entry(device.clone()).or_default()
    }

    pub fn log(&self, device: &Device) -> Option<&DeviceLog> {
        self.logs.get(device)
    }

    /// Most recent status recorded for a device
    pub fn last_status(&self, device: &Device) -> Option<&DeviceStatus> {
        self.logs.get(device).and_then(DeviceLog::last)
    }

    /// Module-specific summary of a device's log
    pub fn summarize(&self, device: &Device) -> Option<Vec<u8>> {
        let strategy = self.strategies.get(device.module)?;
        let log = self.logs.get(device).filter(|log| !log.is_empty());
        match log {
            Some(log) => Some(strategy.summarize(log.statuses())),
            None => {
                error!(device = %device, "Summary requested for a device with no recorded statuses");
                None
            }
        }
    }

    /// Devices that must be re-announced on reconnect
    pub fn devices_with_pending_logs(&self) -> BTreeSet<Device> {
        self.logs
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(device, _)| device.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.values().all(DeviceLog::is_empty)
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}
