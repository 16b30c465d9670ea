//! Three-phase connect sequence

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use fleet_core::{
    codec, ClientMessage, Connect, ConnectResponseType, Device, DeviceState, ServerMessage,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{ConnectError, ConnectionState, EndpointConnection};
use crate::transport::TransportError;

const SESSION_SUFFIX_LEN: usize = 8;

/// `<car-id>` followed by a random alphanumeric suffix
pub(crate) fn generate_session_id(car_id: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", car_id, suffix)
}

impl EndpointConnection {
    /// Run the connect sequence and start the receive loop
    ///
    /// On failure the connection is left `Disconnected` with its transport
    /// stopped; the outage log is untouched.
    pub async fn init_connection(&self) -> Result<(), ConnectError> {
        let modules: Vec<_> = self
            .inner
            .settings
            .modules
            .iter()
            .map(|m| m.module_id)
            .collect();
        info!(endpoint = %self.endpoint(), ?modules, "Initializing connection");

        let devices = self.collect_devices().await?;
        if devices.is_empty() {
            warn!(
                endpoint = %self.endpoint(),
                "No device connected nor pending in the outage log, skipping"
            );
            return Err(ConnectError::NoDevices);
        }

        self.set_state(ConnectionState::Connecting);
        self.inner.stop_requested.store(false, Ordering::SeqCst);

        if let Err(e) = self.run_connect_sequence(&devices).await {
            self.abort_connect().await;
            return Err(e);
        }

        self.set_state(ConnectionState::Connected);
        self.start_receive_loop();
        self.inner.aggregator.lock().clear();
        info!(endpoint = %self.endpoint(), devices = devices.len(), "Connect sequence successful");
        Ok(())
    }

    /// Live devices of this endpoint's modules plus devices with outage logs
    async fn collect_devices(&self) -> Result<Vec<Device>, ConnectError> {
        let mut devices = BTreeSet::new();
        for module in &self.inner.settings.modules {
            let live = self.inner.ipc.get_all_devices(module.module_id).await?;
            devices.extend(live);
        }
        devices.extend(self.inner.aggregator.lock().devices_with_pending_logs());
        Ok(devices.into_iter().collect())
    }

    async fn run_connect_sequence(&self, devices: &[Device]) -> Result<(), ConnectError> {
        self.inner.transport.start().await?;

        info!(endpoint = %self.endpoint(), "Connect sequence: 1st step (sending list of devices)");
        self.connect_phase(devices).await?;
        info!(endpoint = %self.endpoint(), "Connect sequence: 1st step done");

        info!(endpoint = %self.endpoint(), "Connect sequence: 2nd step (sending statuses of devices)");
        self.status_phase(devices).await?;
        info!(endpoint = %self.endpoint(), "Connect sequence: 2nd step done");

        info!(endpoint = %self.endpoint(), "Connect sequence: 3rd step (receiving commands for devices)");
        self.command_phase(devices.len()).await?;
        info!(endpoint = %self.endpoint(), "Connect sequence: 3rd step done");
        Ok(())
    }

    async fn connect_phase(&self, devices: &[Device]) -> Result<(), ConnectError> {
        let identity = &self.inner.settings.identity;
        let session_id = generate_session_id(&identity.car_id);
        *self.inner.session_id.write() = session_id.clone();

        let connect = ClientMessage::Connect(Connect {
            session_id: session_id.clone(),
            company: identity.company.clone(),
            vehicle_name: identity.vehicle_name.clone(),
            devices: devices.to_vec(),
        });
        self.inner.transport.send(&codec::encode(&connect)?).await?;

        match self.next_server_message("connect_response").await? {
            ServerMessage::ConnectResponse(response) => {
                if response.session_id != session_id {
                    return Err(ConnectError::BadSessionId {
                        expected: session_id,
                        received: response.session_id,
                    });
                }
                if response.response_type == ConnectResponseType::AlreadyLogged {
                    return Err(ConnectError::AlreadyLogged(identity.car_id.clone()));
                }
                Ok(())
            }
            other => Err(ConnectError::UnexpectedMessage {
                expected: "connect_response",
                received: other.kind(),
            }),
        }
    }

    async fn status_phase(&self, devices: &[Device]) -> Result<(), ConnectError> {
        for device in devices {
            let recorded = self.inner.aggregator.lock().last_status(device).cloned();
            let last_status = match recorded {
                Some(status) => status,
                None => {
                    debug!(device = %device, "No outage log, fetching latest status");
                    let status = self.inner.ipc.get_last_device_status(device).await?;
                    self.inner.aggregator.lock().record(status.clone());
                    status
                }
            };

            let summary = self.inner.aggregator.lock().summarize(device);
            self.send_status(last_status, DeviceState::Connecting, summary)
                .await?;
        }

        for _ in 0..devices.len() {
            match self.next_server_message("status_response").await? {
                ServerMessage::StatusResponse(response) => {
                    self.inner.tracker.acknowledge(&response)?;
                    debug!(counter = response.message_counter, "Connect status acknowledged");
                }
                other => {
                    return Err(ConnectError::UnexpectedMessage {
                        expected: "status_response",
                        received: other.kind(),
                    })
                }
            }
        }

        if !self.inner.tracker.all_acked() {
            return Err(ConnectError::Timeout(
                "not all connect statuses acknowledged".to_string(),
            ));
        }
        Ok(())
    }

    async fn command_phase(&self, expected: usize) -> Result<(), ConnectError> {
        for _ in 0..expected {
            match self.next_server_message("command").await? {
                ServerMessage::Command(command) => self.handle_command(command).await?,
                other => {
                    return Err(ConnectError::UnexpectedMessage {
                        expected: "command",
                        received: other.kind(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Receive and decode the next backend message of the sequence
    ///
    /// Empty receives (a sentinel left by a channel restart) are retried up
    /// to the configured limit.
    async fn next_server_message(
        &self,
        expected: &'static str,
    ) -> Result<ServerMessage, ConnectError> {
        let settings = &self.inner.settings;
        let mut empty_receives = 0u32;

        loop {
            match self
                .inner
                .transport
                .receive(Some(settings.response_timeout))
                .await
            {
                Ok(Some(bytes)) => return Ok(codec::decode(&bytes)?),
                Ok(None) => {
                    empty_receives += 1;
                    if empty_receives > settings.max_empty_receives {
                        return Err(ConnectError::ChannelStalled(settings.max_empty_receives));
                    }
                    debug!(expected, empty_receives, "Empty receive, retrying");
                }
                Err(TransportError::ChannelTimeout(waited)) => {
                    return Err(ConnectError::Timeout(format!(
                        "no {} within {:?}",
                        expected, waited
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Leave a failed sequence without touching the outage log
    async fn abort_connect(&self) {
        self.inner.tracker.clear();
        self.inner.tracker.clear_connected();
        self.inner.transport.stop().await;
        self.set_state(ConnectionState::Disconnected);
        self.reset_counters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id("CAR42");
        assert!(id.starts_with("CAR42"));
        assert_eq!(id.len(), "CAR42".len() + SESSION_SUFFIX_LEN);
        assert!(id["CAR42".len()..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_session_id("CAR42"), id);
    }
}
