//! Steady-state receive loop and command handling

use std::sync::atomic::Ordering;

use fleet_core::{
    codec, ClientMessage, Command, CommandResponse, CommandResponseType, ServerMessage,
};
use tracing::{debug, error, warn};

use super::{CommandError, EndpointConnection, SendError};
use crate::event::Event;

impl EndpointConnection {
    /// Validate ordering, forward the command and reply to the backend
    ///
    /// An in-order command always consumes its counter and is always
    /// answered. If the module subsystem cannot take it, the backend is told
    /// `DeviceNotConnected` and the IPC failure is returned afterwards.
    pub async fn handle_command(&self, command: Command) -> Result<(), CommandError> {
        let counter = command.message_counter;
        debug!(endpoint = %self.endpoint(), counter, "Handling command");

        {
            let mut last = self.inner.last_command_counter.lock();
            if let Some(previous) = *last {
                if previous + 1 != counter {
                    return Err(CommandError::OutOfOrder {
                        expected: previous + 1,
                        received: counter,
                    });
                }
            }
            *last = Some(counter);
        }

        let device = &command.device_command.device;
        let mut forward_error = None;
        let response_type = if self.inner.tracker.is_connected(device) {
            match self.inner.ipc.pass_command(&command.device_command).await {
                Ok(()) => CommandResponseType::Ok,
                Err(e) => {
                    warn!(device = %device, error = %e, "Module subsystem rejected command");
                    forward_error = Some(e);
                    CommandResponseType::DeviceNotConnected
                }
            }
        } else {
            debug!(device = %device, "Command for a device that is not connected");
            CommandResponseType::DeviceNotConnected
        };

        let response = ClientMessage::CommandResponse(CommandResponse {
            session_id: self.session_id(),
            response_type,
            message_counter: counter,
        });
        let bytes = codec::encode(&response).map_err(SendError::from)?;
        self.inner
            .transport
            .send(&bytes)
            .await
            .map_err(SendError::from)?;
        debug!(counter, ?response_type, "Command response sent");

        match forward_error {
            Some(e) => Err(CommandError::Ipc(e)),
            None => Ok(()),
        }
    }

    pub(super) fn start_receive_loop(&self) {
        let connection = self.clone();
        let handle = tokio::spawn(async move { connection.receive_loop().await });
        if let Some(previous) = self.inner.receive_task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn receive_loop(&self) {
        debug!(endpoint = %self.endpoint(), "Receive loop started");

        while !self.inner.stop_requested.load(Ordering::SeqCst) {
            let bytes = match self.inner.transport.receive(None).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    warn!(endpoint = %self.endpoint(), error = %e, "Receive failed, leaving loop");
                    break;
                }
            };

            let message: ServerMessage = match codec::decode(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(endpoint = %self.endpoint(), error = %e, "Dropping undecodable message");
                    continue;
                }
            };

            match message {
                ServerMessage::Command(command) => match self.handle_command(command).await {
                    Ok(()) => {}
                    Err(CommandError::OutOfOrder { expected, received }) => {
                        error!(
                            endpoint = %self.endpoint(),
                            expected,
                            received,
                            "Out of order command received, will reconnect"
                        );
                        self.resynchronize().await;
                        return;
                    }
                    Err(e) => {
                        error!(endpoint = %self.endpoint(), error = %e, "Command handling failed");
                    }
                },
                ServerMessage::StatusResponse(response) => {
                    debug!(counter = response.message_counter, "Handling status response");
                    if let Err(e) = self.inner.tracker.acknowledge(&response) {
                        error!(
                            endpoint = %self.endpoint(),
                            error = %e,
                            "Backend state out of sync, will reconnect"
                        );
                        self.resynchronize().await;
                        return;
                    }
                }
                ServerMessage::ConnectResponse(_) => {
                    warn!(endpoint = %self.endpoint(), "Ignoring connect response outside connect sequence");
                }
            }
        }

        debug!(endpoint = %self.endpoint(), "Receive loop stopped");
    }

    /// Tear down from within the receive loop and ask for a fresh session
    async fn resynchronize(&self) {
        self.end_connection(false, false).await;
        self.inner
            .dispatcher
            .push(Event::Reconnect(self.endpoint().clone()));
    }
}
