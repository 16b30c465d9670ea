//! Module id to outage strategy registry

use std::collections::HashMap;
use std::sync::Arc;

use fleet_core::{DeviceStatus, ModuleId};

use super::modules::{CarAccessoryAggregator, MissionAggregator, CAR_ACCESSORY_MODULE, MISSION_MODULE};

/// Compresses a device's outage log into one error payload
///
/// Implementations must be a pure function of the ordered log.
pub trait ModuleAggregator: Send + Sync {
    fn summarize(&self, statuses: &[DeviceStatus]) -> Vec<u8>;
}

impl<F> ModuleAggregator for F
where
    F: Fn(&[DeviceStatus]) -> Vec<u8> + Send + Sync,
{
    fn summarize(&self, statuses: &[DeviceStatus]) -> Vec<u8> {
        self(statuses)
    }
}

/// Strategies keyed by module id, unknown modules are absent
#[derive(Clone, Default)]
pub struct AggregatorRegistry {
    strategies: HashMap<ModuleId, Arc<dyn ModuleAggregator>>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the strategies shipped with the gateway
    pub fn builtin() -> Self {
        Self::new()
            .with(MISSION_MODULE, MissionAggregator)
            .with(CAR_ACCESSORY_MODULE, CarAccessoryAggregator)
    }

    pub fn with(mut self, module: ModuleId, strategy: impl ModuleAggregator + 'static) -> Self {
        self.strategies.insert(module, Arc::new(strategy));
        self
    }

    pub fn get(&self, module: ModuleId) -> Option<Arc<dyn ModuleAggregator>> {
        self.strategies.get(&module).cloned()
    }

    pub fn contains(&self, module: ModuleId) -> bool {
        self.strategies.contains_key(&module)
    }

    /// Narrow the registry to the modules served by one endpoint
    pub fn for_modules(&self, modules: impl IntoIterator<Item = ModuleId>) -> Self {
        let strategies = modules
            .into_iter()
            .filter_map(|id| self.strategies.get(&id).map(|s| (id, s.clone())))
            .collect();
        Self { strategies }
    }

    pub fn modules(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.strategies.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
