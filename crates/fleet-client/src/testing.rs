//! Test doubles for the module subsystem and the backend
//!
//! [`MockModuleIpc`] stands in for the device-facing side of the gateway.
//! [`ScriptedBackend`] plays the backend's part of the protocol behind a
//! [`MockTransport`](crate::transport::mock::MockTransport).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{
    codec, ClientMessage, Command, ConnectResponse, ConnectResponseType, Device, DeviceCommand,
    DeviceState, DeviceStatus, IpcError, ModuleId, ModuleIpc, ServerMessage, Status,
    StatusResponse,
};
use parking_lot::{Mutex, RwLock};

use crate::transport::mock::{MockTransport, Responder};

/// In-memory module subsystem
#[derive(Default)]
pub struct MockModuleIpc {
    devices: RwLock<BTreeMap<ModuleId, Vec<Device>>>,
    last_statuses: RwLock<HashMap<Device, DeviceStatus>>,
    commands: RwLock<Vec<DeviceCommand>>,
    failing: AtomicBool,
    stopped: AtomicBool,
}

impl MockModuleIpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live device together with its last status
    pub fn add_device(&self, status: DeviceStatus) {
        let device = status.device.clone();
        let mut devices = self.devices.write();
        let module = devices.entry(device.module).or_default();
        if !module.contains(&device) {
            module.push(device.clone());
        }
        self.last_statuses.write().insert(device, status);
    }

    pub fn remove_device(&self, device: &Device) {
        if let Some(module) = self.devices.write().get_mut(&device.module) {
            module.retain(|d| d != device);
        }
    }

    pub fn set_last_status(&self, status: DeviceStatus) {
        self.last_statuses
            .write()
            .insert(status.device.clone(), status);
    }

    /// Make every request fail as if the IPC link were down
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Commands passed to the module subsystem so far
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.commands.read().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> Result<(), IpcError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IpcError::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleIpc for MockModuleIpc {
    async fn get_all_devices(&self, module: ModuleId) -> Result<Vec<Device>, IpcError> {
        self.check_link()?;
        Ok(self.devices.read().get(&module).cloned().unwrap_or_default())
    }

    async fn get_last_device_status(&self, device: &Device) -> Result<DeviceStatus, IpcError> {
        self.check_link()?;
        self.last_statuses
            .read()
            .get(device)
            .cloned()
            .ok_or_else(|| IpcError::NotFound(device.to_string()))
    }

    async fn pass_command(&self, command: &DeviceCommand) -> Result<(), IpcError> {
        self.check_link()?;
        self.commands.write().push(command.clone());
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// How the scripted backend answers a connect message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReply {
    Accept,
    AlreadyLogged,
    /// Echo a session id other than the one sent
    WrongSession,
    /// Never answer
    Silent,
}

struct BackendState {
    connect_reply: ConnectReply,
    ack_statuses: bool,
    next_command_counter: u64,
    command_data: Vec<u8>,
    session_id: Option<String>,
    announced: Vec<Device>,
    connecting_seen: usize,
    received: Vec<ClientMessage>,
}

impl BackendState {
    fn respond(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let Ok(message) = codec::decode::<ClientMessage>(frame) else {
            return Vec::new();
        };
        self.received.push(message.clone());

        match message {
            ClientMessage::Connect(connect) => {
                self.session_id = Some(connect.session_id.clone());
                self.announced = connect.devices;
                self.connecting_seen = 0;

                let (session_id, response_type) = match self.connect_reply {
                    ConnectReply::Accept => (connect.session_id, ConnectResponseType::Ok),
                    ConnectReply::AlreadyLogged => {
                        (connect.session_id, ConnectResponseType::AlreadyLogged)
                    }
                    ConnectReply::WrongSession => {
                        ("someone-else".to_string(), ConnectResponseType::Ok)
                    }
                    ConnectReply::Silent => return Vec::new(),
                };
                vec![frame_of(&ServerMessage::ConnectResponse(ConnectResponse {
                    session_id,
                    response_type,
                }))]
            }
            ClientMessage::Status(status) => {
                let mut replies = Vec::new();
                if self.ack_statuses {
                    replies.push(frame_of(&ServerMessage::StatusResponse(StatusResponse {
                        message_counter: status.message_counter,
                    })));
                }

                // Initial commands follow the last status of the connect sequence
                if status.device_state == DeviceState::Connecting
                    && self.connecting_seen < self.announced.len()
                {
                    self.connecting_seen += 1;
                    if self.connecting_seen == self.announced.len() {
                        for device in self.announced.clone() {
                            let data = self.command_data.clone();
                            replies.push(self.next_command(device, data));
                        }
                    }
                }
                replies
            }
            ClientMessage::CommandResponse(_) => Vec::new(),
        }
    }

    fn next_command(&mut self, device: Device, data: Vec<u8>) -> Vec<u8> {
        let counter = self.next_command_counter;
        self.next_command_counter += 1;
        self.command_frame(device, data, counter)
    }

    fn command_frame(&self, device: Device, data: Vec<u8>, counter: u64) -> Vec<u8> {
        frame_of(&ServerMessage::Command(Command {
            session_id: self.session_id.clone().unwrap_or_default(),
            message_counter: counter,
            device_command: DeviceCommand::new(device, data),
        }))
    }
}

fn frame_of(message: &ServerMessage) -> Vec<u8> {
    codec::encode(message).unwrap_or_default()
}

/// Backend simulation driving the connect sequence from the other side
///
/// Accepts connects, acknowledges every status and, once the last status of
/// a connect sequence arrives, issues one command per announced device.
#[derive(Clone)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                connect_reply: ConnectReply::Accept,
                ack_statuses: true,
                next_command_counter: 1,
                command_data: b"{}".to_vec(),
                session_id: None,
                announced: Vec::new(),
                connecting_seen: 0,
                received: Vec::new(),
            })),
        }
    }

    pub fn with_connect_reply(self, reply: ConnectReply) -> Self {
        self.state.lock().connect_reply = reply;
        self
    }

    /// Never acknowledge statuses
    pub fn without_acks(self) -> Self {
        self.state.lock().ack_statuses = false;
        self
    }

    /// Counter of the first command the backend issues
    pub fn with_first_command_counter(self, counter: u64) -> Self {
        self.state.lock().next_command_counter = counter;
        self
    }

    pub fn set_ack_statuses(&self, ack: bool) {
        self.state.lock().ack_statuses = ack;
    }

    pub fn set_connect_reply(&self, reply: ConnectReply) {
        self.state.lock().connect_reply = reply;
    }

    pub fn responder(&self) -> Responder {
        let state = self.state.clone();
        Box::new(move |frame| state.lock().respond(frame))
    }

    /// Answer everything published on `transport`
    pub fn install(&self, transport: &MockTransport) {
        transport.set_responder(self.responder());
    }

    /// Encoded command carrying the backend's next counter
    pub fn command(&self, device: &Device, data: &[u8]) -> Vec<u8> {
        self.state.lock().next_command(device.clone(), data.to_vec())
    }

    /// Encoded command with an explicit counter
    pub fn command_with_counter(&self, device: &Device, data: &[u8], counter: u64) -> Vec<u8> {
        self.state
            .lock()
            .command_frame(device.clone(), data.to_vec(), counter)
    }

    pub fn received(&self) -> Vec<ClientMessage> {
        self.state.lock().received.clone()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Session id of the last connect message seen
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}
