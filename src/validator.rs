use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::commands::Command;
use crate::envelope::{Envelope, PROTOCOL_VERSION};
use crate::error::{ErrorCode, ProtocolError, ProtocolResult, Status};
use crate::models::*;

/// Ensure the frame headers declare the supported protocol version.
pub fn validate_version(envelope: &Envelope) -> ProtocolResult<()> {
    let version = envelope.version().unwrap_or("0.0");
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::with_code(
            Status::UpgradeRequired,
            ErrorCode::VersionMismatch,
            format!("Protocol version mismatch: expected {PROTOCOL_VERSION}, got {version}"),
        ));
    }
    Ok(())
}

fn check_shape<T: DeserializeOwned>(payload: &Value) -> ProtocolResult<()> {
    serde_json::from_value::<T>(payload.clone())
        .map(|_| ())
        .map_err(|e| {
            ProtocolError::with_code(
                Status::BadRequest,
                ErrorCode::ParamMissing,
                format!("Schema validation failed: {e}"),
            )
        })
}

/// Run the standard ingress validations: version gate, then the payload
/// schema registered for the command. Commands without a registered schema
/// pass through so forward-compatible commands are not blocked.
pub fn validate(envelope: &Envelope) -> ProtocolResult<()> {
    validate_version(envelope)?;

    let Some(command) = Command::parse(&envelope.command) else {
        return Ok(());
    };
    let payload = &envelope.payload;
    match command {
        Command::AuthLogin | Command::AuthRegister => check_shape::<CredentialsPayload>(payload),
        Command::PresenceUpdate => check_shape::<PresenceUpdatePayload>(payload),
        Command::MessageSend => check_shape::<MessageSendPayload>(payload),
        Command::RoomCreate => check_shape::<RoomCreatePayload>(payload),
        Command::RoomJoin => check_shape::<RoomJoinPayload>(payload),
        Command::RoomLeave | Command::RoomMembers | Command::RoomInfo | Command::RoomDelete => {
            check_shape::<RoomIdPayload>(payload)
        }
        Command::RoomKick => check_shape::<RoomKickPayload>(payload),
        Command::FileRequest => check_shape::<FileRequestPayload>(payload),
        Command::FileAccept | Command::FileReject | Command::FileComplete => {
            check_shape::<SessionIdPayload>(payload)
        }
        Command::FileError => check_shape::<FileErrorPayload>(payload),
        Command::FriendRequest => check_shape::<FriendRequestPayload>(payload),
        Command::FriendAccept | Command::FriendReject => check_shape::<RequestIdPayload>(payload),
        Command::FriendDelete => check_shape::<FriendDeletePayload>(payload),
        Command::VoiceCall => check_shape::<VoiceCallPayload>(payload),
        Command::VoiceAnswer | Command::VoiceReject | Command::VoiceEnd => {
            check_shape::<CallIdPayload>(payload)
        }
        Command::VoiceData => check_shape::<VoiceDataPayload>(payload),
        _ => Ok(()),
    }
}

/// Deserialize a payload that already passed schema validation. A mismatch
/// still maps to the same PARAM_MISSING error rather than panicking.
pub fn parse_payload<T: DeserializeOwned>(envelope: &Envelope) -> ProtocolResult<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        ProtocolError::with_code(
            Status::BadRequest,
            ErrorCode::ParamMissing,
            format!("Schema validation failed: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn login_frame(version: &str) -> Envelope {
        let mut envelope = Envelope::request(
            Command::AuthLogin,
            json!({"username": "alice", "password": "secret"}),
        );
        envelope.headers.insert("version".into(), json!(version));
        envelope
    }

    #[test]
    fn version_gate_rejects_mismatch() {
        let err = validate(&login_frame("0.9")).unwrap_err();
        assert_eq!(err.status, Status::UpgradeRequired);
        assert_eq!(err.code, Some(ErrorCode::VersionMismatch));
    }

    #[test]
    fn version_gate_rejects_missing_header() {
        let mut envelope = login_frame(PROTOCOL_VERSION);
        envelope.headers.remove("version");
        assert!(validate(&envelope).is_err());
    }

    #[test]
    fn missing_fields_report_param_missing() {
        let mut envelope = login_frame(PROTOCOL_VERSION);
        envelope.payload = json!({"username": "alice"});
        let err = validate(&envelope).unwrap_err();
        assert_eq!(err.status, Status::BadRequest);
        assert_eq!(err.code, Some(ErrorCode::ParamMissing));
    }

    #[test]
    fn unknown_commands_only_pass_version_gate() {
        let mut envelope = login_frame(PROTOCOL_VERSION);
        envelope.command = "experimental/ping".into();
        envelope.payload = json!({"anything": true});
        assert!(validate(&envelope).is_ok());

        envelope.headers.insert("version".into(), json!("2.0"));
        assert!(validate(&envelope).is_err());
    }

    #[test]
    fn valid_payloads_pass() {
        assert!(validate(&login_frame(PROTOCOL_VERSION)).is_ok());

        let send = Envelope::request(
            Command::MessageSend,
            json!({
                "conversation_id": "alice|bob",
                "target": {"type": "user", "id": "bob"},
                "content": {"type": "text", "text": "hi"},
            }),
        );
        assert!(validate(&send).is_ok());
    }
}
