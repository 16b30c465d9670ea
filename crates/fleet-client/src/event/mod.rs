//! Gateway events and the prioritized dispatcher that carries them
//!
//! Every asynchronous occurrence (transport loss, ack timeouts, inbound
//! device traffic, protocol violations detected on a receive task) reaches
//! the [`GatewayClient`](crate::client::GatewayClient) as an [`Event`]
//! pushed onto the shared [`EventDispatcher`].

mod dispatcher;

pub use dispatcher::EventDispatcher;

use fleet_core::Endpoint;

/// Priority tier of an event, `Highest` is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Highest,
    High,
    Normal,
    Low,
}

/// Occurrences handled by the gateway's main loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Transport link to the endpoint dropped
    BrokerDisconnect(Endpoint),
    /// Encoded device status received from the module subsystem
    SendStatus(Vec<u8>),
    /// Module subsystem sent something on a topic the gateway does not handle
    UnexpectedMessage(String),
    /// A sent status was not acknowledged in time
    StatusResponseTimeout(Endpoint),
    /// Tear the connection down and run the connect sequence again
    Reconnect(Endpoint),
    /// Encoded final status of a device that left the vehicle
    DeviceDisconnect(Vec<u8>),
    /// Destroy the connection to the endpoint entirely
    Disconnect(Endpoint),
}

impl Event {
    pub fn priority(&self) -> Priority {
        match self {
            Event::Disconnect(_) | Event::UnexpectedMessage(_) => Priority::High,
            _ => Priority::Normal,
        }
    }

    /// Event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Event::BrokerDisconnect(_) => "broker_disconnect",
            Event::SendStatus(_) => "send_status",
            Event::UnexpectedMessage(_) => "unexpected_message",
            Event::StatusResponseTimeout(_) => "status_response_timeout",
            Event::Reconnect(_) => "reconnect",
            Event::DeviceDisconnect(_) => "device_disconnect",
            Event::Disconnect(_) => "disconnect",
        }
    }
}
