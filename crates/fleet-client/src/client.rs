//! Gateway client - event loop over all endpoint connections
//!
//! The [`GatewayClient`] is the single consumer of the [`EventDispatcher`].
//! Every lifecycle transition of every endpoint connection (connect,
//! teardown, reconnect, removal) happens inside [`GatewayClient::run`], so
//! transitions for one endpoint never race each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{codec, CodecError, DeviceState, DeviceStatus, Endpoint, ModuleId, ModuleIpc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatorRegistry;
use crate::config::GatewayConfig;
use crate::connection::{
    ConnectionSettings, EndpointConnection, ReconnectPolicy, SendError,
};
use crate::event::{Event, EventDispatcher};
use crate::transport::TransportFactory;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Status belongs to a module no endpoint serves
    #[error("No endpoint defined for module with id {0}")]
    NoEndpoint(ModuleId),

    #[error("Malformed device status: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to send status: {0}")]
    Send(#[from] SendError),
}

struct ReconnectTimer {
    handle: JoinHandle<()>,
    delay: Duration,
}

/// Owner of all endpoint connections and their reconnect timers
pub struct GatewayClient {
    config: Arc<GatewayConfig>,
    dispatcher: EventDispatcher,
    ipc: Arc<dyn ModuleIpc>,
    transports: Arc<dyn TransportFactory>,
    registry: AggregatorRegistry,
    connections: HashMap<Endpoint, EndpointConnection>,
    reconnect_timers: HashMap<Endpoint, ReconnectTimer>,
}

impl GatewayClient {
    /// Create a client using the built-in outage strategies
    pub fn new(
        config: GatewayConfig,
        dispatcher: EventDispatcher,
        ipc: Arc<dyn ModuleIpc>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher,
            ipc,
            transports,
            registry: AggregatorRegistry::builtin(),
            connections: HashMap::new(),
            reconnect_timers: HashMap::new(),
        }
    }

    /// Replace the outage strategy registry
    pub fn with_registry(mut self, registry: AggregatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn connection(&self, endpoint: &Endpoint) -> Option<&EndpointConnection> {
        self.connections.get(endpoint)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Delay of the reconnect timer pending for an endpoint
    pub fn pending_reconnect(&self, endpoint: &Endpoint) -> Option<Duration> {
        self.reconnect_timers
            .get(endpoint)
            .filter(|timer| !timer.handle.is_finished())
            .map(|timer| timer.delay)
    }

    /// Consume events until the shutdown sentinel arrives
    pub async fn run(&mut self) {
        info!("Gateway client started");
        while let Some(event) = self.dispatcher.pop().await {
            if let Err(e) = self.handle_event(event).await {
                error!(error = %e, "Failed to handle event");
            }
        }
        info!("Shutdown requested, leaving event loop");
    }

    pub async fn handle_event(&mut self, event: Event) -> Result<(), ClientError> {
        info!(event = event.name(), "Handling event");
        match event {
            Event::SendStatus(bytes) => {
                let status: DeviceStatus = codec::decode(&bytes)?;
                self.handle_device_status(status, DeviceState::Running).await
            }
            Event::DeviceDisconnect(bytes) => {
                let status: DeviceStatus = codec::decode(&bytes)?;
                self.handle_device_status(status, DeviceState::Disconnect)
                    .await
            }
            Event::StatusResponseTimeout(endpoint)
            | Event::BrokerDisconnect(endpoint)
            | Event::Reconnect(endpoint) => {
                let Some(connection) = self.connections.get(&endpoint).cloned() else {
                    warn!(endpoint = %endpoint, "Attempted to reconnect on destroyed connection, skipping");
                    return Ok(());
                };
                connection.end_connection(false, true).await;
                self.connect_to_endpoint(&endpoint).await;
                Ok(())
            }
            Event::Disconnect(endpoint) => {
                if !self.connections.contains_key(&endpoint) {
                    error!(endpoint = %endpoint, "Attempted to disconnect on destroyed connection, skipping");
                    return Ok(());
                }
                self.remove_connection(&endpoint).await;
                Ok(())
            }
            Event::UnexpectedMessage(topic) => {
                warn!(%topic, "Unexpected message from module subsystem, skipping");
                Ok(())
            }
        }
    }

    /// Route a device status to the connection serving its module
    ///
    /// The first status for an endpoint creates its connection and runs the
    /// connect sequence; statuses for a connection that is down go to its
    /// outage log.
    pub async fn handle_device_status(
        &mut self,
        status: DeviceStatus,
        device_state: DeviceState,
    ) -> Result<(), ClientError> {
        let module = status.device.module;
        let endpoint = self
            .config
            .endpoint_for_module(module)
            .ok_or(ClientError::NoEndpoint(module))?;

        let Some(connection) = self.connections.get(&endpoint).cloned() else {
            self.add_connection(&endpoint);
            self.connect_to_endpoint(&endpoint).await;
            return Ok(());
        };

        if connection.is_connected() {
            connection.send_status(status, device_state, None).await?;
        } else {
            debug!(endpoint = %endpoint, device = %status.device, "Connection down, recording status");
            connection.fill_outage_log(Some(status));
        }
        Ok(())
    }

    fn add_connection(&mut self, endpoint: &Endpoint) -> EndpointConnection {
        let settings = ConnectionSettings::from_config(&self.config, endpoint);
        let transport =
            self.transports
                .create(endpoint, &self.config.car_id, self.dispatcher.clone());
        let connection = EndpointConnection::new(
            settings,
            transport,
            &self.registry,
            self.ipc.clone(),
            self.dispatcher.clone(),
        );
        info!(endpoint = %endpoint, "Adding connection");
        self.connections.insert(endpoint.clone(), connection.clone());
        connection
    }

    async fn remove_connection(&mut self, endpoint: &Endpoint) {
        self.cancel_reconnect_timer(endpoint);
        if let Some(connection) = self.connections.remove(endpoint) {
            connection.end_connection(true, true).await;
            info!(endpoint = %endpoint, "Connection removed");
        }
    }

    /// Run the connect sequence and classify a failure into a retry decision
    pub async fn connect_to_endpoint(&mut self, endpoint: &Endpoint) {
        self.cancel_reconnect_timer(endpoint);
        let Some(connection) = self.connections.get(endpoint).cloned() else {
            return;
        };

        let Err(e) = connection.init_connection().await else {
            return;
        };

        match e.reconnect_policy() {
            ReconnectPolicy::Short => {
                error!(endpoint = %endpoint, error = %e, "Connect sequence failed");
                self.schedule_reconnect(endpoint, self.config.timing.reconnect_delay());
            }
            ReconnectPolicy::Long => {
                warn!(endpoint = %endpoint, error = %e, "Connection to endpoint refused");
                self.schedule_reconnect(endpoint, self.config.timing.already_logged_delay());
            }
            ReconnectPolicy::Remove => {
                debug!(endpoint = %endpoint, "No devices, completely destroying connection");
                self.dispatcher.push(Event::Disconnect(endpoint.clone()));
            }
        }
    }

    fn schedule_reconnect(&mut self, endpoint: &Endpoint, delay: Duration) {
        info!(endpoint = %endpoint, delay_ms = delay.as_millis() as u64, "Trying again later");

        let dispatcher = self.dispatcher.clone();
        let target = endpoint.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.push(Event::Reconnect(target));
        });

        if let Some(previous) = self
            .reconnect_timers
            .insert(endpoint.clone(), ReconnectTimer { handle, delay })
        {
            previous.handle.abort();
        }
    }

    fn cancel_reconnect_timer(&mut self, endpoint: &Endpoint) {
        if let Some(timer) = self.reconnect_timers.remove(endpoint) {
            timer.handle.abort();
        }
    }

    /// Stop IPC, cancel timers, end every connection and wake the loop
    pub async fn stop(&mut self) {
        info!("Stopping gateway client");
        self.ipc.stop().await;

        for (_, timer) in self.reconnect_timers.drain() {
            timer.handle.abort();
        }
        for connection in self.connections.values() {
            connection.end_connection(false, true).await;
        }
        self.dispatcher.push_shutdown();
    }
}
