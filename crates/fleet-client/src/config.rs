//! Gateway configuration
//!
//! This module contains the configuration types for the gateway: car
//! identity, the module subsystem IPC link, protocol timing and the static
//! module to endpoint mapping.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use fleet_core::{Endpoint, ModuleId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Unique car identifier, prefix of every session id
    pub car_id: String,
    pub vehicle_name: String,
    pub company: String,
    /// Module subsystem IPC link
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub transport: TransportSettings,
    /// Backend endpoints and the modules they serve
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Car identity announced in every connect message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarIdentity {
    pub car_id: String,
    pub vehicle_name: String,
    pub company: String,
}

// =============================================================================
// IPC Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_ipc_host")]
    pub host: String,
    #[serde(default = "default_ipc_port")]
    pub port: u16,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_ipc_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_ipc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ipc_port() -> u16 {
    1883
}

fn default_ipc_request_timeout() -> u64 {
    5000
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: default_ipc_host(),
            port: default_ipc_port(),
            request_timeout_ms: default_ipc_request_timeout(),
        }
    }
}

impl IpcConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// Timing Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait for each backend reply during the connect sequence
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Wait for a status acknowledgment before raising a timeout
    #[serde(default = "default_status_response_timeout")]
    pub status_response_timeout_ms: u64,
    /// Delay before retrying a failed connect sequence
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Multiplier of the reconnect delay when the backend reports an active session
    #[serde(default = "default_already_logged_backoff_factor")]
    pub already_logged_backoff_factor: u32,
    /// Empty receives tolerated while waiting for the connect response
    #[serde(default = "default_max_empty_receives")]
    pub max_empty_receives: u32,
}

fn default_response_timeout() -> u64 {
    8000
}

fn default_status_response_timeout() -> u64 {
    5000
}

fn default_reconnect_delay() -> u64 {
    3000
}

fn default_already_logged_backoff_factor() -> u32 {
    5
}

fn default_max_empty_receives() -> u32 {
    3
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            status_response_timeout_ms: default_status_response_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            already_logged_backoff_factor: default_already_logged_backoff_factor(),
            max_empty_receives: default_max_empty_receives(),
        }
    }
}

impl TimingConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn status_response_timeout(&self) -> Duration {
        Duration::from_millis(self.status_response_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn already_logged_delay(&self) -> Duration {
        self.reconnect_delay() * self.already_logged_backoff_factor
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// =============================================================================
// Endpoint Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl EndpointConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub module_id: ModuleId,
    #[serde(default)]
    pub module_name: String,
}

impl GatewayConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.car_id.trim().is_empty() {
            return Err(ConfigError::Invalid("car_id must not be empty".to_string()));
        }

        let mut owners: HashMap<ModuleId, Endpoint> = HashMap::new();
        for endpoint_config in &self.endpoints {
            let endpoint = endpoint_config.endpoint();
            for module in &endpoint_config.modules {
                if let Some(previous) = owners.insert(module.module_id, endpoint.clone()) {
                    if previous != endpoint {
                        return Err(ConfigError::Invalid(format!(
                            "module {} is mapped to both {} and {}",
                            module.module_id, previous, endpoint
                        )));
                    }
                }
            }
        }

        if self.timing.already_logged_backoff_factor == 0 {
            return Err(ConfigError::Invalid(
                "already_logged_backoff_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Endpoint serving a module, `None` when the module is unmapped
    pub fn endpoint_for_module(&self, module: ModuleId) -> Option<Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.modules.iter().any(|m| m.module_id == module))
            .map(EndpointConfig::endpoint)
    }

    /// Modules served by an endpoint
    pub fn modules_for_endpoint(&self, endpoint: &Endpoint) -> Vec<ModuleConfig> {
        self.endpoints
            .iter()
            .filter(|e| e.address == endpoint.address && e.port == endpoint.port)
            .flat_map(|e| e.modules.iter().cloned())
            .collect()
    }

    /// Distinct configured endpoints
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for e in &self.endpoints {
            let endpoint = e.endpoint();
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        endpoints
    }

    pub fn identity(&self) -> CarIdentity {
        CarIdentity {
            car_id: self.car_id.clone(),
            vehicle_name: self.vehicle_name.clone(),
            company: self.company.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
car_id = "CAR1"
vehicle_name = "test-vehicle"
company = "acme"

[ipc]
host = "10.0.0.2"
port = 1884

[timing]
reconnect_delay_ms = 100

[[endpoints]]
address = "backend-a"
port = 1883
modules = [{ module_id = 1, module_name = "mission" }]

[[endpoints]]
address = "backend-b"
port = 1883

[[endpoints.modules]]
module_id = 2
module_name = "car_accessory"
"#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.ipc.endpoint(), Endpoint::new("10.0.0.2", 1884));
        assert_eq!(config.timing.reconnect_delay(), Duration::from_millis(100));
        assert_eq!(config.timing.already_logged_delay(), Duration::from_millis(500));
        assert_eq!(config.timing.response_timeout_ms, 8000);
        assert_eq!(config.endpoints().len(), 2);
        assert_eq!(
            config.identity(),
            CarIdentity {
                car_id: "CAR1".to_string(),
                vehicle_name: "test-vehicle".to_string(),
                company: "acme".to_string(),
            }
        );
    }

    #[test]
    fn test_module_lookups() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        let b = Endpoint::new("backend-b", 1883);

        assert_eq!(config.endpoint_for_module(2), Some(b.clone()));
        assert_eq!(config.endpoint_for_module(9), None);
        let modules = config.modules_for_endpoint(&b);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].module_name, "car_accessory");
    }

    #[test]
    fn test_module_on_two_endpoints_rejected() {
        let doc = r#"
car_id = "CAR1"
vehicle_name = "v"
company = "c"

[[endpoints]]
address = "a"
port = 1
modules = [{ module_id = 1 }]

[[endpoints]]
address = "b"
port = 1
modules = [{ module_id = 1 }]
"#;
        let result = GatewayConfig::from_toml_str(doc);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_car_id_rejected() {
        let doc = r#"
car_id = ""
vehicle_name = "v"
company = "c"
"#;
        assert!(matches!(
            GatewayConfig::from_toml_str(doc),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.car_id, "CAR1");

        let missing = GatewayConfig::load("/nonexistent/fleetd.toml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config =
            GatewayConfig::from_toml_str(include_str!("../../../config/fleetd.toml")).unwrap();
        assert_eq!(config.endpoints().len(), 2);
        assert_eq!(
            config.endpoint_for_module(2),
            Some(Endpoint::new("127.0.0.1", 1884))
        );
        assert_eq!(config.timing.already_logged_delay(), Duration::from_secs(15));
    }
}
