//! Backend protocol messages
//!
//! Every exchange with the fleet-management backend is one of the messages
//! below. The gateway sends [`ClientMessage`]s and receives
//! [`ServerMessage`]s:
//!
//! ```text
//! Connect          ──►  ConnectResponse   (session id echoed, OK / ALREADY_LOGGED)
//! Status           ──►  StatusResponse    (acknowledged by message counter)
//! CommandResponse  ◄──  Command           (counter assigned by the backend)
//! ```

use serde::{Deserialize, Serialize};

use crate::models::{Device, DeviceCommand, DeviceStatus};

/// Device lifecycle tag attached to every outgoing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Connecting,
    Running,
    Disconnect,
}

/// First message of the connect sequence, announcing the devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub session_id: String,
    pub company: String,
    pub vehicle_name: String,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectResponseType {
    Ok,
    AlreadyLogged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: String,
    #[serde(rename = "type")]
    pub response_type: ConnectResponseType,
}

/// Status envelope sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub session_id: String,
    pub device_state: DeviceState,
    /// Per-connection counter, strictly increasing within a session
    pub message_counter: u64,
    pub device_status: DeviceStatus,
    /// Aggregated outage summary, only present on re-announcement
    #[serde(
        default,
        with = "crate::serde_hex::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message_counter: u64,
}

/// Command envelope received from the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub session_id: String,
    pub message_counter: u64,
    pub device_command: DeviceCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResponseType {
    Ok,
    DeviceNotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub session_id: String,
    #[serde(rename = "type")]
    pub response_type: CommandResponseType,
    pub message_counter: u64,
}

/// Messages sent by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Connect(Connect),
    Status(Status),
    CommandResponse(CommandResponse),
}

/// Messages sent by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectResponse(ConnectResponse),
    StatusResponse(StatusResponse),
    Command(Command),
}

impl ServerMessage {
    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectResponse(_) => "connect_response",
            ServerMessage::StatusResponse(_) => "status_response",
            ServerMessage::Command(_) => "command",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_messages_are_externally_tagged() {
        let msg = ServerMessage::StatusResponse(StatusResponse { message_counter: 7 });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"status_response": {"message_counter": 7}}));
    }

    #[test]
    fn test_error_message_omitted_when_absent() {
        let status = Status {
            session_id: "CAR1abc".to_string(),
            device_state: DeviceState::Running,
            message_counter: 1,
            device_status: DeviceStatus::new(Device::new(1, 0, "r", "n"), b"{}".to_vec()),
            error_message: None,
        };
        let json = serde_json::to_value(ClientMessage::Status(status)).unwrap();
        assert!(json["status"].get("error_message").is_none());
        assert_eq!(json["status"]["device_state"], "RUNNING");
    }

    #[test]
    fn test_connect_response_type_field() {
        let json = r#"{"connect_response":{"session_id":"s","type":"ALREADY_LOGGED"}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::ConnectResponse(resp) => {
                assert_eq!(resp.response_type, ConnectResponseType::AlreadyLogged);
            }
            other => panic!("Expected ConnectResponse, got {:?}", other),
        }
    }
}
