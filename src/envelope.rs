use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::commands::Command;
use crate::error::ProtocolError;

/// Declared protocol version; frames carrying anything else are rejected.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Response,
    Event,
}

/// Control-channel envelope. Every frame on the wire is one of these,
/// serialized as a single JSON object followed by a newline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "new_frame_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default = "unix_now")]
    pub timestamp: i64,
    pub command: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub payload: Value,
}

pub fn new_frame_id() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

fn version_headers() -> Map<String, Value> {
    let mut headers = Map::new();
    headers.insert("version".into(), Value::String(PROTOCOL_VERSION.into()));
    headers
}

impl Envelope {
    /// Build a request frame (used by tests and by clients).
    pub fn request(command: Command, payload: Value) -> Self {
        Self {
            id: new_frame_id(),
            kind: FrameKind::Request,
            timestamp: unix_now(),
            command: command.as_str().to_string(),
            headers: version_headers(),
            payload,
        }
    }

    /// Build a response to `request`, echoing its id and headers.
    pub fn response_to(request: &Envelope, command: &str, payload: Value) -> Self {
        let mut headers = request.headers.clone();
        headers
            .entry("version".to_string())
            .or_insert_with(|| Value::String(PROTOCOL_VERSION.into()));
        Self {
            id: request.id.clone(),
            kind: FrameKind::Response,
            timestamp: unix_now(),
            command: command.to_string(),
            headers,
            payload,
        }
    }

    /// Build a server-originated event frame.
    pub fn event(command: Command, payload: Value) -> Self {
        Self {
            id: new_frame_id(),
            kind: FrameKind::Event,
            timestamp: unix_now(),
            command: command.as_str().to_string(),
            headers: version_headers(),
            payload,
        }
    }

    /// Convert a raised protocol error into the response frame the client
    /// is waiting on.
    pub fn error_response(request: &Envelope, error: &ProtocolError) -> Self {
        let command = crate::commands::error_ack_command(&request.command).to_string();
        Self::response_to(request, &command, error.to_payload())
    }

    pub fn version(&self) -> Option<&str> {
        self.headers.get("version").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, Status};
    use serde_json::json;

    #[test]
    fn response_echoes_request_id_and_headers() {
        let request = Envelope::request(Command::RoomList, json!({}));
        let response =
            Envelope::response_to(&request, Command::RoomList.as_str(), json!({"status": 200}));
        assert_eq!(response.id, request.id);
        assert_eq!(response.kind, FrameKind::Response);
        assert_eq!(response.version(), Some(PROTOCOL_VERSION));
    }

    #[test]
    fn error_response_maps_to_paired_ack() {
        let request = Envelope::request(Command::AuthLogin, json!({}));
        let error = ProtocolError::with_code(
            Status::Unauthorized,
            ErrorCode::InvalidToken,
            "Invalid credentials",
        );
        let response = Envelope::error_response(&request, &error);
        assert_eq!(response.command, "auth/login_ack");
        assert_eq!(response.payload["status"], 401);
        assert_eq!(response.payload["error_code"], 1001);
    }

    #[test]
    fn frame_ids_are_128_bit_hex() {
        let id = new_frame_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
