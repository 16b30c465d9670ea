//! Byte encoding for protocol and IPC payloads
//!
//! Messages travel as JSON documents. Transports never look inside a
//! payload; they only move the bytes produced here.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Encode a message into its wire bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

/// Decode a message from its wire bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Device, DeviceCommand};
    use crate::protocol::{Command, ServerMessage};

    #[test]
    fn test_command_survives_encoding() {
        let msg = ServerMessage::Command(Command {
            session_id: "CAR1xyz".to_string(),
            message_counter: 42,
            device_command: DeviceCommand::new(Device::new(2, 1, "left", "button"), b"on".to_vec()),
        });
        let bytes = encode(&msg).unwrap();
        let decoded: ServerMessage = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<ServerMessage, _> = decode(b"\x00\x01not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_bad_hex_payload_fails() {
        let json = br#"{"device":{"module":1,"device_type":0,"device_role":"r","device_name":"n"},"status_data":"zz"}"#;
        let result: Result<crate::models::DeviceStatus, _> = decode(json);
        assert!(result.is_err());
    }
}
