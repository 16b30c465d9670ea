//! Module subsystem IPC over TCP
//!
//! Topic-addressed frames are exchanged with the module subsystem using the
//! same length-prefixed framing as the backend transport. Each frame is a
//! JSON document `{"topic": ..., "payload": <hex>}`.
//!
//! | topic                    | direction | payload                 |
//! |--------------------------|-----------|-------------------------|
//! | `get-all-devices`        | out       | module id               |
//! | `all-devices`            | in        | list of devices         |
//! | `get-last-device-status` | out       | device                  |
//! | `last-device-status`     | in        | device status           |
//! | `pass-command`           | out       | device command          |
//! | `send-status`            | in        | device status (event)   |
//! | `exc-device-disconnect`  | in        | device status (event)   |

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{
    codec, Device, DeviceCommand, DeviceStatus, Endpoint, IpcError, ModuleId, ModuleIpc,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{Event, EventDispatcher};
use crate::transport::frame::{read_frame, write_frame};

pub const GET_ALL_DEVICES: &str = "get-all-devices";
pub const ALL_DEVICES: &str = "all-devices";
pub const GET_LAST_DEVICE_STATUS: &str = "get-last-device-status";
pub const LAST_DEVICE_STATUS: &str = "last-device-status";
pub const PASS_COMMAND: &str = "pass-command";
pub const SEND_STATUS: &str = "send-status";
pub const DEVICE_DISCONNECT: &str = "exc-device-disconnect";

const CONNECT_RETRY_DELAY_MS: u64 = 500;

/// One IPC message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcFrame {
    pub topic: String,
    /// Hex-encoded payload
    pub payload: String,
}

impl IpcFrame {
    pub fn new(topic: &str, payload: &[u8]) -> Self {
        Self {
            topic: topic.to_string(),
            payload: hex::encode(payload),
        }
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, IpcError> {
        hex::decode(&self.payload)
            .map_err(|e| IpcError::Malformed(format!("bad payload on {}: {}", self.topic, e)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModuleRequest {
    module: ModuleId,
}

/// Module IPC client over a TCP link
pub struct TcpModuleIpc {
    endpoint: Endpoint,
    request_timeout: Duration,
    dispatcher: EventDispatcher,
    writer: Mutex<OwnedWriteHalf>,
    replies: Mutex<mpsc::UnboundedReceiver<IpcFrame>>,
    reader_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TcpModuleIpc {
    /// Connect, retrying until the module subsystem accepts
    pub async fn connect(
        endpoint: Endpoint,
        request_timeout: Duration,
        dispatcher: EventDispatcher,
    ) -> Self {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match Self::try_connect(&endpoint, request_timeout, dispatcher.clone()).await {
                Ok(ipc) => return ipc,
                Err(e) => {
                    if attempt == 1 || attempt % 20 == 0 {
                        warn!(endpoint = %endpoint, attempt, error = %e, "IPC connection failed, retrying");
                    }
                    tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS)).await;
                }
            }
        }
    }

    /// Single connection attempt
    pub async fn try_connect(
        endpoint: &Endpoint,
        request_timeout: Duration,
        dispatcher: EventDispatcher,
    ) -> Result<Self, IpcError> {
        let addr = format!("{}:{}", endpoint.address, endpoint.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
        let (reader, writer) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let ipc = Self {
            endpoint: endpoint.clone(),
            request_timeout,
            dispatcher,
            writer: Mutex::new(writer),
            replies: Mutex::new(reply_rx),
            reader_handle: parking_lot::Mutex::new(None),
        };
        ipc.start_reader(reader, reply_tx);
        info!(endpoint = %endpoint, "Connected to module IPC");
        Ok(ipc)
    }

    fn start_reader(&self, mut reader: OwnedReadHalf, replies: mpsc::UnboundedSender<IpcFrame>) {
        let dispatcher = self.dispatcher.clone();
        let endpoint = self.endpoint.clone();

        let handle = tokio::spawn(async move {
            loop {
                let bytes = match read_frame(&mut reader).await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "IPC read failed");
                        break;
                    }
                };
                let frame: IpcFrame = match codec::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed IPC frame");
                        continue;
                    }
                };

                match frame.topic.as_str() {
                    SEND_STATUS | DEVICE_DISCONNECT => {
                        let Ok(payload) = frame.payload_bytes() else {
                            warn!(topic = %frame.topic, "Dropping IPC frame with bad payload");
                            continue;
                        };
                        let event = if frame.topic == SEND_STATUS {
                            Event::SendStatus(payload)
                        } else {
                            Event::DeviceDisconnect(payload)
                        };
                        dispatcher.push(event);
                    }
                    ALL_DEVICES | LAST_DEVICE_STATUS => {
                        let _ = replies.send(frame);
                    }
                    other => {
                        dispatcher.push(Event::UnexpectedMessage(other.to_string()));
                    }
                }
            }
            warn!(endpoint = %endpoint, "IPC link closed");
        });

        *self.reader_handle.lock() = Some(handle);
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), IpcError> {
        let frame = codec::encode(&IpcFrame::new(topic, payload))?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame)
            .await
            .map_err(|e| IpcError::SendFailed(e.to_string()))?;
        debug!(topic, "IPC frame published");
        Ok(())
    }

    /// Publish a request and wait for the reply on `reply_topic`
    async fn request(
        &self,
        topic: &str,
        payload: &[u8],
        reply_topic: &str,
    ) -> Result<Vec<u8>, IpcError> {
        // Holding the reply queue serializes requests
        let mut replies = self.replies.lock().await;
        while replies.try_recv().is_ok() {}

        self.publish(topic, payload).await?;

        loop {
            let frame = tokio::time::timeout(self.request_timeout, replies.recv())
                .await
                .map_err(|_| IpcError::Timeout(topic.to_string()))?
                .ok_or(IpcError::ConnectionClosed)?;
            if frame.topic == reply_topic {
                return frame.payload_bytes();
            }
            debug!(topic = %frame.topic, "Ignoring stale IPC reply");
        }
    }
}

#[async_trait]
impl ModuleIpc for TcpModuleIpc {
    async fn get_all_devices(&self, module: ModuleId) -> Result<Vec<Device>, IpcError> {
        let payload = codec::encode(&ModuleRequest { module })?;
        let reply = self.request(GET_ALL_DEVICES, &payload, ALL_DEVICES).await?;
        Ok(codec::decode(&reply)?)
    }

    async fn get_last_device_status(&self, device: &Device) -> Result<DeviceStatus, IpcError> {
        let payload = codec::encode(device)?;
        let reply = self
            .request(GET_LAST_DEVICE_STATUS, &payload, LAST_DEVICE_STATUS)
            .await?;
        Ok(codec::decode(&reply)?)
    }

    async fn pass_command(&self, command: &DeviceCommand) -> Result<(), IpcError> {
        let payload = codec::encode(command)?;
        self.publish(PASS_COMMAND, &payload).await
    }

    async fn stop(&self) {
        if let Some(handle) = self.reader_handle.lock().take() {
            handle.abort();
        }
        let _ = self.writer.lock().await.shutdown().await;
        self.dispatcher.push_shutdown();
        info!(endpoint = %self.endpoint, "Module IPC stopped");
    }
}

impl Drop for TcpModuleIpc {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn send(socket: &mut TcpStream, topic: &str, payload: &[u8]) {
        let bytes = codec::encode(&IpcFrame::new(topic, payload)).unwrap();
        write_frame(socket, &bytes).await.unwrap();
    }

    async fn recv(socket: &mut TcpStream) -> IpcFrame {
        let bytes = read_frame(socket).await.unwrap().unwrap();
        codec::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requests_and_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let dispatcher = EventDispatcher::new();
        let device = Device::new(2, 0, "left", "button");

        let server_device = device.clone();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let request = recv(&mut socket).await;
            assert_eq!(request.topic, GET_ALL_DEVICES);
            let devices = codec::encode(&vec![server_device.clone()]).unwrap();
            send(&mut socket, ALL_DEVICES, &devices).await;

            let command = recv(&mut socket).await;
            assert_eq!(command.topic, PASS_COMMAND);

            let status = codec::encode(&DeviceStatus::new(server_device, b"{}".to_vec())).unwrap();
            send(&mut socket, SEND_STATUS, &status).await;
            send(&mut socket, "mystery", b"").await;
            socket
        });

        let ipc = TcpModuleIpc::try_connect(&endpoint, Duration::from_secs(2), dispatcher.clone())
            .await
            .unwrap();

        let devices = ipc.get_all_devices(2).await.unwrap();
        assert_eq!(devices, vec![device.clone()]);
        ipc.pass_command(&DeviceCommand::new(device.clone(), b"on".to_vec()))
            .await
            .unwrap();

        let _socket = server.await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), dispatcher.pop())
            .await
            .unwrap();
        // UnexpectedMessage has the higher priority, so it may be served first
        let second = tokio::time::timeout(Duration::from_secs(2), dispatcher.pop())
            .await
            .unwrap();
        let events = [first, second];
        assert!(events.contains(&Some(Event::UnexpectedMessage("mystery".to_string()))));
        assert!(events
            .iter()
            .any(|e| matches!(e, Some(Event::SendStatus(_)))));

        ipc.stop().await;
        assert_eq!(dispatcher.try_pop(), Some(None));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let server = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let ipc = TcpModuleIpc::try_connect(
            &endpoint,
            Duration::from_millis(50),
            EventDispatcher::new(),
        )
        .await
        .unwrap();
        let _socket = server.await.unwrap();

        let result = ipc
            .get_last_device_status(&Device::new(1, 0, "r", "n"))
            .await;
        assert!(matches!(result, Err(IpcError::Timeout(_))));
    }
}
