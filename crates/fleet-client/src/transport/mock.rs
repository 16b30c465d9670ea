//! In-memory transport channel for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{codec, ClientMessage, Endpoint, ServerMessage};
use parking_lot::RwLock;

use super::{InboundQueue, TransportChannel, TransportError, TransportFactory};
use crate::event::{Event, EventDispatcher};

/// Computes the backend's replies to one published frame
pub type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Mock transport channel
///
/// Records every published frame and optionally answers through a
/// [`Responder`], simulating a backend on the other side.
pub struct MockTransport {
    endpoint: Endpoint,
    dispatcher: EventDispatcher,
    inbound: InboundQueue,
    started: AtomicBool,
    refuse: AtomicBool,
    start_count: AtomicUsize,
    sent: RwLock<Vec<Vec<u8>>>,
    responder: RwLock<Option<Responder>>,
}

impl MockTransport {
    pub fn new(endpoint: Endpoint, dispatcher: EventDispatcher) -> Self {
        Self {
            endpoint,
            dispatcher,
            inbound: InboundQueue::new(),
            started: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            start_count: AtomicUsize::new(0),
            sent: RwLock::new(Vec::new()),
            responder: RwLock::new(None),
        }
    }

    /// Make subsequent `start` calls fail as if the backend refused
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Install the backend simulation answering published frames
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.write() = Some(responder);
    }

    /// Queue an inbound frame as if the backend sent it
    pub fn inject(&self, payload: Vec<u8>) {
        self.inbound.push(payload);
    }

    /// Encode and queue a backend message
    pub fn inject_message(&self, message: &ServerMessage) {
        if let Ok(bytes) = codec::encode(message) {
            self.inject(bytes);
        }
    }

    /// Queue an empty receive, as left behind by a channel restart
    pub fn inject_empty(&self) {
        self.inbound.push_sentinel();
    }

    /// Drop the link and report it the way a real transport would
    pub fn simulate_disconnect(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.dispatcher
            .push(Event::BrokerDisconnect(self.endpoint.clone()));
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Raw frames published so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.read().clone()
    }

    /// Published frames decoded as gateway messages
    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.sent
            .read()
            .iter()
            .filter_map(|frame| codec::decode(frame).ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.write().clear();
    }
}

#[async_trait]
impl TransportChannel for MockTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "Connection refused".to_string(),
            ));
        }
        self.inbound.drain().await;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.sent.write().push(payload.to_vec());
        tracing::debug!(len = payload.len(), "Mock transport: sent frame");

        if let Some(responder) = self.responder.read().as_ref() {
            for reply in responder(payload) {
                self.inbound.push(reply);
            }
        }
        Ok(())
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        self.inbound.recv(timeout).await
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.inbound.push_sentinel();
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Hands out one shared [`MockTransport`] per endpoint
///
/// Tests grab the transport for an endpoint through
/// [`transport`](Self::transport) before or after the gateway creates it.
pub struct MockTransportFactory {
    dispatcher: EventDispatcher,
    transports: RwLock<HashMap<Endpoint, Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            dispatcher,
            transports: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the transport for an endpoint
    pub fn transport(&self, endpoint: &Endpoint) -> Arc<MockTransport> {
        self.transports
            .write()
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(MockTransport::new(endpoint.clone(), self.dispatcher.clone()))
            })
            .clone()
    }

    pub fn created(&self) -> usize {
        self.transports.read().len()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        _car_id: &str,
        _dispatcher: EventDispatcher,
    ) -> Arc<dyn TransportChannel> {
        self.transport(endpoint)
    }
}
