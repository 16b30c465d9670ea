//! fleet-client - Backend protocol engine for the fleet gateway
//!
//! This crate connects the vehicle's devices to one or more fleet-management
//! backends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         GatewayClient                            │
//! │   single consumer of the EventDispatcher, owns reconnect timers  │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │ one per endpoint                 ▲ events
//!                 ▼                                  │
//! ┌──────────────────────────────┐    ┌──────────────┴───────────────┐
//! │      EndpointConnection      │    │        EventDispatcher       │
//! │  connect sequence, receive   │───►│  priority tiers, FIFO within │
//! │  loop, command handling      │    │  a tier, shutdown sentinel   │
//! ├──────────────────────────────┤    └──────────────▲───────────────┘
//! │ TransportChannel             │                   │
//! │ PendingAckTracker  (timers) ─┼───────────────────┤
//! │ OutageAggregator             │                   │
//! └──────────────────────────────┘          TcpModuleIpc (device traffic)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let dispatcher = EventDispatcher::new();
//! let ipc = TcpModuleIpc::connect(config.ipc.endpoint(), timeout, dispatcher.clone()).await;
//! let transports = TcpTransportFactory::new(config.transport.connect_timeout());
//! let mut client = GatewayClient::new(config, dispatcher, Arc::new(ipc), Arc::new(transports));
//! client.run().await;
//! client.stop().await;
//! ```

pub mod ack;
pub mod aggregator;
pub mod client;
pub mod config;
pub mod connection;
pub mod event;
pub mod ipc;
pub mod testing;
pub mod transport;

pub use ack::{AckError, PendingAckTracker};
pub use aggregator::{AggregatorRegistry, ModuleAggregator, OutageAggregator};
pub use client::{ClientError, GatewayClient};
pub use config::{ConfigError, GatewayConfig};
pub use connection::{
    CommandError, ConnectError, ConnectionState, EndpointConnection, ReconnectPolicy, SendError,
};
pub use event::{Event, EventDispatcher, Priority};
pub use ipc::TcpModuleIpc;
pub use transport::tcp::TcpTransportFactory;
pub use transport::{TransportChannel, TransportError, TransportFactory};
