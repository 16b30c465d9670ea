//! Transport channels to backend endpoints
//!
//! A [`TransportChannel`] is a bidirectional, topic-addressed pipe to one
//! backend endpoint. Inbound payloads are queued as they arrive and handed
//! out by [`TransportChannel::receive`]; losing the link is reported as an
//! [`Event::BrokerDisconnect`](crate::event::Event::BrokerDisconnect) on the
//! dispatcher rather than as a return value.
//!
//! - [`tcp`]: length-prefixed frames over TCP
//! - [`mock`]: in-memory channel for tests

pub mod error;
pub mod frame;
pub mod mock;
pub mod queue;
pub mod tcp;

pub use error::TransportError;
pub use queue::InboundQueue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::Endpoint;

use crate::event::EventDispatcher;

/// Topic the gateway listens on for backend messages
pub fn subscribe_topic(car_id: &str) -> String {
    format!("to-client/{}", car_id)
}

/// Topic the gateway publishes its messages to
pub fn publish_topic(car_id: &str) -> String {
    format!("to-server/{}", car_id)
}

/// Message pipe to one backend endpoint
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Establish the link and begin queuing inbound messages
    ///
    /// Anything left queued from a previous link is discarded.
    async fn start(&self) -> Result<(), TransportError>;

    /// Publish a payload to the backend
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next inbound payload
    ///
    /// Returns `Ok(None)` when the channel was stopped while waiting and
    /// [`TransportError::ChannelTimeout`] when `timeout` elapses first.
    /// `None` as timeout waits indefinitely.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError>;

    /// Halt the link and unblock any waiting receiver
    async fn stop(&self);

    fn endpoint(&self) -> &Endpoint;
}

/// Creates channels for endpoints
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        endpoint: &Endpoint,
        car_id: &str,
        dispatcher: EventDispatcher,
    ) -> Arc<dyn TransportChannel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_are_scoped_by_car() {
        assert_eq!(subscribe_topic("CAR7"), "to-client/CAR7");
        assert_eq!(publish_topic("CAR7"), "to-server/CAR7");
    }
}
