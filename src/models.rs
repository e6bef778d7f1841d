use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

// ─── Targets ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    User,
    Room,
}

/// Delivery target for messages, file transfers, and voice calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub kind: TargetType,
    pub id: String,
}

// ─── Request payloads ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsPayload {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceUpdatePayload {
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageSendPayload {
    pub conversation_id: String,
    pub target: Target,
    pub content: Value,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomCreatePayload {
    pub room_id: String,
    #[serde(default)]
    pub encrypted: bool,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomJoinPayload {
    pub room_id: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomIdPayload {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomKickPayload {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRequestPayload {
    pub target: Target,
    pub file_name: String,
    pub file_size: i64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionIdPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileErrorPayload {
    pub session_id: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendRequestPayload {
    pub target_id: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestIdPayload {
    pub request_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendDeletePayload {
    pub friend_id: String,
}

fn default_call_type() -> String {
    "direct".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceCallPayload {
    #[serde(default = "default_call_type")]
    pub call_type: String,
    pub target: Target,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallIdPayload {
    pub call_id: String,
}

/// Audio frame payload; `data` stays hex-encoded and is relayed verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceDataPayload {
    pub call_id: String,
    pub data: String,
    pub codec: Option<String>,
    pub seq: Option<u64>,
}

// ─── Persistent rows ────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Room {
    pub room_id: String,
    pub owner: String,
    pub encrypted: bool,
    pub created_at: i64,
    pub password_hash: Option<String>,
    pub metadata: Option<String>,
}

/// Message row as returned from `insert_message`.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Accepted,
    Rejected,
    Unreachable,
    Completed,
    Error,
}

impl FileStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Unreachable => "unreachable",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileSession {
    pub session_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub checksum: Option<String>,
    pub sender_id: String,
    pub target_type: String,
    pub target_id: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FriendRequestRow {
    pub id: i64,
    pub from_user: String,
    pub to_user: String,
    pub message: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_parses_wire_shape() {
        let target: Target = serde_json::from_value(json!({"type": "user", "id": "bob"})).unwrap();
        assert_eq!(target.kind, TargetType::User);
        assert_eq!(target.id, "bob");
        assert!(serde_json::from_value::<Target>(json!({"type": "channel", "id": "x"})).is_err());
    }

    #[test]
    fn voice_call_defaults_to_direct() {
        let payload: VoiceCallPayload =
            serde_json::from_value(json!({"target": {"type": "user", "id": "bob"}})).unwrap();
        assert_eq!(payload.call_type, "direct");
    }
}
