//! TCP transport channel
//!
//! After connecting, the gateway sends a hello frame naming the topics it
//! subscribes and publishes to, then exchanges length-prefixed frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{codec, Endpoint};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::{read_frame, write_frame};
use super::{
    publish_topic, subscribe_topic, InboundQueue, TransportChannel, TransportError,
    TransportFactory,
};
use crate::event::{Event, EventDispatcher};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// First frame sent on every new link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub subscribe: String,
    pub publish: String,
}

/// Transport channel over a TCP stream
pub struct TcpTransport {
    endpoint: Endpoint,
    hello: Hello,
    connect_timeout: Duration,
    dispatcher: EventDispatcher,
    inbound: Arc<InboundQueue>,
    running: Arc<AtomicBool>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(
        endpoint: Endpoint,
        car_id: &str,
        connect_timeout: Duration,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            endpoint,
            hello: Hello {
                subscribe: subscribe_topic(car_id),
                publish: publish_topic(car_id),
            },
            connect_timeout,
            dispatcher,
            inbound: Arc::new(InboundQueue::new()),
            running: Arc::new(AtomicBool::new(false)),
            writer: tokio::sync::Mutex::new(None),
            reader_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start_reader(&self, mut reader: tokio::net::tcp::OwnedReadHalf) {
        let inbound = self.inbound.clone();
        let running = self.running.clone();
        let dispatcher = self.dispatcher.clone();
        let endpoint = self.endpoint.clone();

        let handle = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        debug!(endpoint = %endpoint, len = frame.len(), "Frame received");
                        inbound.push(frame);
                    }
                    Ok(None) => {
                        debug!(endpoint = %endpoint, "Link closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "Link read failed");
                        break;
                    }
                }
            }

            // A local stop clears the flag first, so only remote loss is reported
            if running.swap(false, Ordering::SeqCst) {
                warn!(endpoint = %endpoint, "Broker link lost");
                dispatcher.push(Event::BrokerDisconnect(endpoint));
            }
        });

        if let Some(old) = self.reader_handle.lock().replace(handle) {
            old.abort();
        }
    }
}

#[async_trait]
impl TransportChannel for TcpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.running.load(Ordering::SeqCst) {
            self.stop().await;
        }
        self.inbound.drain().await;

        let addr = format!("{}:{}", self.endpoint.address, self.endpoint.port);
        info!(%addr, "Connecting to backend");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", addr)))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (reader, mut writer) = stream.into_split();
        let hello = codec::encode(&self.hello)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        write_frame(&mut writer, &hello).await?;

        *self.writer.lock().await = Some(writer);
        self.running.store(true, Ordering::SeqCst);
        self.start_reader(reader);

        debug!(endpoint = %self.endpoint, topic = %self.hello.subscribe, "Subscribed");
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        write_frame(writer, payload).await
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        self.inbound.recv(timeout).await
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().take() {
            handle.abort();
        }
        self.writer.lock().await.take();
        self.inbound.push_sentinel();
        debug!(endpoint = %self.endpoint, "Transport stopped");
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().take() {
            handle.abort();
        }
    }
}

/// Builds [`TcpTransport`]s
pub struct TcpTransportFactory {
    connect_timeout: Duration,
}

impl TcpTransportFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        car_id: &str,
        dispatcher: EventDispatcher,
    ) -> Arc<dyn TransportChannel> {
        Arc::new(TcpTransport::new(
            endpoint.clone(),
            car_id,
            self.connect_timeout,
            dispatcher,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_hello_then_frames() {
        let (listener, endpoint) = listener().await;
        let dispatcher = EventDispatcher::new();
        let transport =
            TcpTransport::new(endpoint, "CAR1", Duration::from_secs(1), dispatcher.clone());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let hello = read_frame(&mut socket).await.unwrap().unwrap();
            let hello: Hello = codec::decode(&hello).unwrap();
            let request = read_frame(&mut socket).await.unwrap().unwrap();
            write_frame(&mut socket, b"pong").await.unwrap();
            (hello, request, socket)
        });

        transport.start().await.unwrap();
        transport.send(b"ping").await.unwrap();
        let reply = transport.receive(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(reply, Some(b"pong".to_vec()));

        let (hello, request, _socket) = server.await.unwrap();
        assert_eq!(hello.subscribe, "to-client/CAR1");
        assert_eq!(hello.publish, "to-server/CAR1");
        assert_eq!(request, b"ping".to_vec());

        transport.stop().await;
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_raises_broker_disconnect() {
        let (listener, endpoint) = listener().await;
        let dispatcher = EventDispatcher::new();
        let transport = TcpTransport::new(
            endpoint.clone(),
            "CAR1",
            Duration::from_secs(1),
            dispatcher.clone(),
        );

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut socket).await;
            drop(socket);
        });

        transport.start().await.unwrap();
        server.await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), dispatcher.pop())
            .await
            .unwrap();
        assert_eq!(event, Some(Event::BrokerDisconnect(endpoint)));
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (listener, endpoint) = listener().await;
        drop(listener);

        let transport = TcpTransport::new(
            endpoint,
            "CAR1",
            Duration::from_secs(1),
            EventDispatcher::new(),
        );
        let result = transport.start().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_stop_unblocks_receiver() {
        let transport = Arc::new(TcpTransport::new(
            Endpoint::new("127.0.0.1", 1),
            "CAR1",
            Duration::from_secs(1),
            EventDispatcher::new(),
        ));

        let waiter = transport.clone();
        let pending = tokio::spawn(async move { waiter.receive(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = TcpTransport::new(
            Endpoint::new("127.0.0.1", 1),
            "CAR1",
            Duration::from_secs(1),
            EventDispatcher::new(),
        );
        let result = transport.send(b"x").await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}
