//! Per-endpoint protocol state machine
//!
//! An [`EndpointConnection`] owns the transport channel, the pending-ack
//! tracker and the outage aggregator for one backend endpoint.
//!
//! ```text
//! DISCONNECTED ──init_connection──► CONNECTING ──3 phases ok──► CONNECTED
//!       ▲                               │                           │
//!       └──────── failure ──────────────┴──── end_connection ───────┘
//! ```
//!
//! The connect sequence lives in `handshake`, the steady-state receive
//! loop and command handling in `receive`.

mod error;
mod handshake;
mod receive;

pub use error::{CommandError, ConnectError, ReconnectPolicy, SendError};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{
    codec, ClientMessage, Device, DeviceState, DeviceStatus, Endpoint, ModuleIpc, Status,
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ack::PendingAckTracker;
use crate::aggregator::{AggregatorRegistry, OutageAggregator};
use crate::config::{CarIdentity, GatewayConfig, ModuleConfig};
use crate::event::EventDispatcher;
use crate::transport::TransportChannel;

/// Lifecycle state of an endpoint connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Static parameters of one endpoint connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: Endpoint,
    pub modules: Vec<ModuleConfig>,
    pub identity: CarIdentity,
    /// Wait for each reply during the connect sequence
    pub response_timeout: Duration,
    /// Wait for a status acknowledgment
    pub status_response_timeout: Duration,
    pub max_empty_receives: u32,
}

impl ConnectionSettings {
    pub fn from_config(config: &GatewayConfig, endpoint: &Endpoint) -> Self {
        Self {
            endpoint: endpoint.clone(),
            modules: config.modules_for_endpoint(endpoint),
            identity: config.identity(),
            response_timeout: config.timing.response_timeout(),
            status_response_timeout: config.timing.status_response_timeout(),
            max_empty_receives: config.timing.max_empty_receives,
        }
    }
}

struct ConnectionInner {
    settings: ConnectionSettings,
    transport: Arc<dyn TransportChannel>,
    tracker: PendingAckTracker,
    aggregator: Mutex<OutageAggregator>,
    ipc: Arc<dyn ModuleIpc>,
    dispatcher: EventDispatcher,
    state: RwLock<ConnectionState>,
    session_id: RwLock<String>,
    status_counter: AtomicU64,
    last_command_counter: Mutex<Option<u64>>,
    stop_requested: AtomicBool,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

/// Connection to one backend endpoint
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct EndpointConnection {
    inner: Arc<ConnectionInner>,
}

impl EndpointConnection {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn TransportChannel>,
        registry: &AggregatorRegistry,
        ipc: Arc<dyn ModuleIpc>,
        dispatcher: EventDispatcher,
    ) -> Self {
        let tracker = PendingAckTracker::new(
            settings.endpoint.clone(),
            dispatcher.clone(),
            settings.status_response_timeout,
        );
        let aggregator =
            OutageAggregator::new(registry.for_modules(settings.modules.iter().map(|m| m.module_id)));

        Self {
            inner: Arc::new(ConnectionInner {
                settings,
                transport,
                tracker,
                aggregator: Mutex::new(aggregator),
                ipc,
                dispatcher,
                state: RwLock::new(ConnectionState::Disconnected),
                session_id: RwLock::new(String::new()),
                status_counter: AtomicU64::new(0),
                last_command_counter: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                receive_task: Mutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.settings.endpoint
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.write() = state;
    }

    /// Session id of the current or last connect attempt
    pub fn session_id(&self) -> String {
        self.inner.session_id.read().clone()
    }

    pub fn tracker(&self) -> &PendingAckTracker {
        &self.inner.tracker
    }

    /// True when the backend considers at least one device connected
    pub fn has_any_device_connected(&self) -> bool {
        self.inner.tracker.any_connected()
    }

    /// Counter of the last command handled in this session
    pub fn last_command_counter(&self) -> Option<u64> {
        *self.inner.last_command_counter.lock()
    }

    /// Devices with statuses recorded during the outage
    pub fn pending_outage_devices(&self) -> BTreeSet<Device> {
        self.inner.aggregator.lock().devices_with_pending_logs()
    }

    /// Outage summary that would accompany the device's next announcement
    pub fn outage_summary(&self, device: &Device) -> Option<Vec<u8>> {
        self.inner.aggregator.lock().summarize(device)
    }

    fn next_status_counter(&self) -> u64 {
        self.inner.status_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish a device status and track its acknowledgment
    ///
    /// A `Running` status for a device the backend does not consider
    /// connected is sent as `Connecting`. Returns the message counter used.
    pub async fn send_status(
        &self,
        device_status: DeviceStatus,
        device_state: DeviceState,
        error_message: Option<Vec<u8>>,
    ) -> Result<u64, SendError> {
        let tracker = &self.inner.tracker;
        let device = &device_status.device;

        let device_state = match device_state {
            DeviceState::Connecting => {
                tracker.mark_connected(device);
                DeviceState::Connecting
            }
            DeviceState::Running if !tracker.is_connected(device) => {
                tracker.mark_connected(device);
                DeviceState::Connecting
            }
            DeviceState::Running => DeviceState::Running,
            DeviceState::Disconnect => {
                tracker.mark_disconnected(device);
                DeviceState::Disconnect
            }
        };

        let has_summary = error_message.is_some();
        let status = Status {
            session_id: self.session_id(),
            device_state,
            message_counter: self.next_status_counter(),
            device_status,
            error_message,
        };
        let counter = status.message_counter;
        let bytes = codec::encode(&ClientMessage::Status(status.clone()))?;

        tracker.register(status);
        self.inner.transport.send(&bytes).await?;
        debug!(
            endpoint = %self.endpoint(),
            counter,
            state = ?device_state,
            has_summary,
            "Status sent"
        );
        Ok(counter)
    }

    /// Move un-acknowledged statuses, plus `current`, into the outage log
    pub fn fill_outage_log(&self, current: Option<DeviceStatus>) {
        let unacked = self.inner.tracker.take_unacked();
        let mut aggregator = self.inner.aggregator.lock();
        for status in unacked {
            aggregator.record(status.device_status);
        }
        if let Some(status) = current {
            aggregator.record(status);
        }
    }

    /// Tear the connection down
    ///
    /// Unless `complete`, un-acknowledged statuses are kept in the outage
    /// log for the next connect sequence. `wait_receive` joins the receive
    /// loop and must be `false` when called from that loop.
    pub async fn end_connection(&self, complete: bool, wait_receive: bool) {
        self.inner.tracker.clear_timers();
        self.set_state(ConnectionState::Disconnected);
        self.inner.transport.stop().await;
        self.inner.stop_requested.store(true, Ordering::SeqCst);

        if complete {
            self.inner.tracker.clear();
        } else {
            self.fill_outage_log(None);
        }
        self.inner.tracker.clear_connected();

        let receive_task = self.inner.receive_task.lock().take();
        if let (Some(handle), true) = (receive_task, wait_receive) {
            let _ = handle.await;
        }

        self.reset_counters();
        info!(endpoint = %self.endpoint(), complete, "Connection ended");
    }

    fn reset_counters(&self) {
        self.inner.status_counter.store(0, Ordering::SeqCst);
        *self.inner.last_command_counter.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ConnectReply, MockModuleIpc, ScriptedBackend};
    use crate::transport::mock::MockTransport;
    use fleet_core::{ClientMessage, Command, CommandResponseType, DeviceCommand};

    struct Fixture {
        connection: EndpointConnection,
        transport: Arc<MockTransport>,
        ipc: Arc<MockModuleIpc>,
        dispatcher: EventDispatcher,
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("backend", 1883)
    }

    fn lamp() -> Device {
        Device::new(1, 0, "front", "lamp")
    }

    fn lamp_status(data: &str) -> DeviceStatus {
        DeviceStatus::new(lamp(), data.as_bytes().to_vec())
    }

    fn fixture(response_timeout: Duration) -> Fixture {
        let dispatcher = EventDispatcher::new();
        let transport = Arc::new(MockTransport::new(endpoint(), dispatcher.clone()));
        let ipc = Arc::new(MockModuleIpc::new());
        let settings = ConnectionSettings {
            endpoint: endpoint(),
            modules: vec![ModuleConfig {
                module_id: 1,
                module_name: "mission".to_string(),
            }],
            identity: CarIdentity {
                car_id: "CAR1".to_string(),
                vehicle_name: "tester".to_string(),
                company: "acme".to_string(),
            },
            response_timeout,
            status_response_timeout: Duration::from_secs(5),
            max_empty_receives: 3,
        };
        let connection = EndpointConnection::new(
            settings,
            transport.clone(),
            &AggregatorRegistry::builtin(),
            ipc.clone(),
            dispatcher.clone(),
        );
        Fixture {
            connection,
            transport,
            ipc,
            dispatcher,
        }
    }

    fn sent_states(transport: &MockTransport) -> Vec<(DeviceState, u64)> {
        transport
            .sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Status(s) => Some((s.device_state, s.message_counter)),
                _ => None,
            })
            .collect()
    }

    fn command(counter: u64, device: Device) -> Command {
        Command {
            session_id: String::new(),
            message_counter: counter,
            device_command: DeviceCommand::new(device, b"on".to_vec()),
        }
    }

    #[tokio::test]
    async fn test_running_first_is_sent_as_connecting() {
        let f = fixture(Duration::from_secs(1));
        f.transport.start().await.unwrap();
        let c = &f.connection;

        c.send_status(lamp_status("a"), DeviceState::Running, None).await.unwrap();
        c.send_status(lamp_status("b"), DeviceState::Running, None).await.unwrap();
        c.send_status(lamp_status("c"), DeviceState::Disconnect, None).await.unwrap();
        assert!(!c.has_any_device_connected());
        c.send_status(lamp_status("d"), DeviceState::Running, None).await.unwrap();

        assert_eq!(
            sent_states(&f.transport),
            vec![
                (DeviceState::Connecting, 1),
                (DeviceState::Running, 2),
                (DeviceState::Disconnect, 3),
                (DeviceState::Connecting, 4),
            ]
        );
        assert_eq!(c.tracker().pending_count(), 4);
    }

    #[tokio::test]
    async fn test_command_ordering() {
        let f = fixture(Duration::from_secs(1));
        f.transport.start().await.unwrap();
        f.connection.tracker().mark_connected(&lamp());

        f.connection.handle_command(command(3, lamp())).await.unwrap();
        f.connection.handle_command(command(4, lamp())).await.unwrap();
        assert_eq!(f.connection.last_command_counter(), Some(4));

        let skipped = f.connection.handle_command(command(6, lamp())).await;
        assert!(matches!(
            skipped,
            Err(CommandError::OutOfOrder {
                expected: 5,
                received: 6
            })
        ));
        let duplicate = f.connection.handle_command(command(4, lamp())).await;
        assert!(matches!(duplicate, Err(CommandError::OutOfOrder { .. })));

        assert_eq!(f.connection.last_command_counter(), Some(4));
        assert_eq!(f.ipc.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_command_for_unconnected_device_not_forwarded() {
        let f = fixture(Duration::from_secs(1));
        f.transport.start().await.unwrap();

        f.connection.handle_command(command(1, lamp())).await.unwrap();

        assert!(f.ipc.commands().is_empty());
        match f.transport.sent_messages().last() {
            Some(ClientMessage::CommandResponse(resp)) => {
                assert_eq!(resp.response_type, CommandResponseType::DeviceNotConnected);
                assert_eq!(resp.message_counter, 1);
            }
            other => panic!("Expected CommandResponse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_answered_when_module_rejects_it() {
        let f = fixture(Duration::from_secs(1));
        f.transport.start().await.unwrap();
        f.connection.tracker().mark_connected(&lamp());
        f.ipc.set_failing(true);

        let result = f.connection.handle_command(command(1, lamp())).await;
        assert!(matches!(result, Err(CommandError::Ipc(_))));
        assert_eq!(f.connection.last_command_counter(), Some(1));
        match f.transport.sent_messages().last() {
            Some(ClientMessage::CommandResponse(resp)) => {
                assert_eq!(resp.response_type, CommandResponseType::DeviceNotConnected);
                assert_eq!(resp.message_counter, 1);
            }
            other => panic!("Expected CommandResponse, got {:?}", other),
        }

        // The counter was consumed, so the next command is still in order
        f.ipc.set_failing(false);
        f.connection.handle_command(command(2, lamp())).await.unwrap();
        assert_eq!(f.ipc.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_ipc_failure_aborts_before_transport() {
        let f = fixture(Duration::from_secs(1));
        f.ipc.add_device(lamp_status("{}"));
        f.ipc.set_failing(true);

        let err = f.connection.init_connection().await.unwrap_err();
        assert!(matches!(err, ConnectError::Ipc(_)));
        assert_eq!(err.reconnect_policy(), ReconnectPolicy::Short);
        assert_eq!(f.transport.start_count(), 0);
        assert_eq!(f.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_sequence_reaches_connected() {
        let f = fixture(Duration::from_secs(1));
        f.ipc.add_device(lamp_status(r#"{"on":false}"#));
        let backend = ScriptedBackend::new();
        backend.install(&f.transport);

        f.connection.init_connection().await.unwrap();

        assert_eq!(f.connection.state(), ConnectionState::Connected);
        assert!(f.connection.session_id().starts_with("CAR1"));
        assert_eq!(backend.session_id(), Some(f.connection.session_id()));
        assert_eq!(f.connection.last_command_counter(), Some(1));
        assert_eq!(f.ipc.commands().len(), 1);
        assert!(f.connection.tracker().all_acked());

        let received = backend.received();
        assert!(matches!(&received[0], ClientMessage::Connect(c) if c.devices == vec![lamp()]));
        match &received[1] {
            ClientMessage::Status(status) => {
                assert_eq!(status.device_state, DeviceState::Connecting);
                // Mission summary of the single status fetched for the announcement
                assert_eq!(status.error_message.as_deref(), Some(&br#"{"status_count":1}"#[..]));
            }
            other => panic!("Expected Status, got {:?}", other),
        }
        assert!(matches!(
            &received[2],
            ClientMessage::CommandResponse(r) if r.response_type == CommandResponseType::Ok
        ));

        f.connection.end_connection(true, true).await;
        assert_eq!(f.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_no_devices_aborts_before_transport() {
        let f = fixture(Duration::from_secs(1));
        let result = f.connection.init_connection().await;
        assert!(matches!(result, Err(ConnectError::NoDevices)));
        assert_eq!(f.transport.start_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_session_id() {
        let f = fixture(Duration::from_secs(1));
        f.ipc.add_device(lamp_status("{}"));
        ScriptedBackend::new()
            .with_connect_reply(ConnectReply::WrongSession)
            .install(&f.transport);

        let result = f.connection.init_connection().await;
        assert!(matches!(result, Err(ConnectError::BadSessionId { .. })));
        assert_eq!(f.connection.state(), ConnectionState::Disconnected);
        assert!(!f.transport.is_started());
    }

    #[tokio::test]
    async fn test_already_logged() {
        let f = fixture(Duration::from_secs(1));
        f.ipc.add_device(lamp_status("{}"));
        ScriptedBackend::new()
            .with_connect_reply(ConnectReply::AlreadyLogged)
            .install(&f.transport);

        let err = f.connection.init_connection().await.unwrap_err();
        assert_eq!(err.reconnect_policy(), ReconnectPolicy::Long);
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let f = fixture(Duration::from_millis(50));
        f.ipc.add_device(lamp_status("{}"));
        ScriptedBackend::new()
            .with_connect_reply(ConnectReply::Silent)
            .install(&f.transport);

        let result = f.connection.init_connection().await;
        assert!(matches!(result, Err(ConnectError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_missing_acks_fail_status_phase() {
        let f = fixture(Duration::from_millis(50));
        f.ipc.add_device(lamp_status("{}"));
        ScriptedBackend::new().without_acks().install(&f.transport);

        // Initial commands arrive where acknowledgments were expected
        let result = f.connection.init_connection().await;
        assert!(matches!(
            result,
            Err(ConnectError::UnexpectedMessage {
                expected: "status_response",
                received: "command"
            })
        ));
        // In-flight handshake statuses are dropped with the attempt
        assert!(f.connection.tracker().all_acked());
        assert!(f.dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_empty_receives_are_bounded() {
        let f = fixture(Duration::from_secs(2));
        f.ipc.add_device(lamp_status("{}"));

        let transport = f.transport.clone();
        let injector = tokio::spawn(async move {
            while transport.sent().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            for _ in 0..4 {
                transport.inject_empty();
            }
        });

        let result = f.connection.init_connection().await;
        injector.await.unwrap();
        assert!(matches!(result, Err(ConnectError::ChannelStalled(3))));
    }

    #[tokio::test]
    async fn test_end_connection_keeps_unacked_in_outage_log() {
        let f = fixture(Duration::from_secs(1));
        f.ipc.add_device(lamp_status("{}"));
        let backend = ScriptedBackend::new();
        backend.install(&f.transport);
        f.connection.init_connection().await.unwrap();

        backend.set_ack_statuses(false);
        f.transport.clear_sent();
        f.connection
            .send_status(lamp_status("late"), DeviceState::Running, None)
            .await
            .unwrap();
        assert_eq!(f.transport.sent().len(), 1);
        assert_eq!(f.connection.tracker().pending_count(), 1);

        f.connection.end_connection(false, true).await;
        assert!(!f.connection.has_any_device_connected());
        assert_eq!(f.connection.pending_outage_devices().len(), 1);
        assert_eq!(
            f.connection.outage_summary(&lamp()),
            Some(br#"{"status_count":1}"#.to_vec())
        );
    }
}
