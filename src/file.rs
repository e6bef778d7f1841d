use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::require_user;
use crate::bridge::FileBridge;
use crate::commands::Command;
use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult, Status};
use crate::models::{FileErrorPayload, FileRequestPayload, FileSession, FileStatus, SessionIdPayload, TargetType};
use crate::registry::{ConnectionContext, ConnectionRegistry};
use crate::store::{self, DbPool};
use crate::validator::parse_payload;

/// Coordinates the file-transfer handshake on the control channel and
/// status notifications for both peers; the byte stream itself flows
/// through the bridge on the data port.
pub struct FileService {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<FileBridge>,
    channel_host: String,
    channel_port: u16,
}

impl FileService {
    pub fn new(
        pool: DbPool,
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<FileBridge>,
        channel_host: String,
        channel_port: u16,
    ) -> Self {
        Self {
            pool,
            registry,
            bridge,
            channel_host,
            channel_port,
        }
    }

    /// `file/request`: create one session per recipient and push the
    /// request event to each online target.
    pub async fn handle_request(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: FileRequestPayload = parse_payload(msg)?;
        if payload.file_name.is_empty() || payload.file_size <= 0 {
            return Err(ProtocolError::bad_request("Missing file metadata"));
        }

        let mut sessions: Vec<Value> = Vec::new();
        match payload.target.kind {
            TargetType::User => {
                let target_id = payload.target.id.clone();
                let session_id = Uuid::now_v7().simple().to_string();
                store::files::create(
                    &self.pool,
                    &session_id,
                    &payload.file_name,
                    payload.file_size,
                    payload.checksum.as_deref(),
                    &user_id,
                    "user",
                    &target_id,
                )
                .await?;
                let delivered = self
                    .notify(
                        &target_id,
                        Command::FileRequest,
                        json!({
                            "session_id": session_id,
                            "from_user": user_id,
                            "file_name": payload.file_name,
                            "file_size": payload.file_size,
                            "checksum": payload.checksum,
                        }),
                    )
                    .await;
                if !delivered {
                    store::files::update_status(&self.pool, &session_id, FileStatus::Unreachable)
                        .await?;
                    return Ok(self.respond(
                        msg,
                        Command::FileRequestAck,
                        json!({
                            "status": Status::NotFound.as_u16(),
                            "session_id": session_id,
                            "error_message": "Target user offline",
                        }),
                    ));
                }
                sessions.push(json!({"session_id": session_id, "target_id": target_id}));
            }
            TargetType::Room => {
                let room_id = payload.target.id.clone();
                let members = store::rooms::list_members(&self.pool, &room_id).await?;
                for member in members.iter().filter(|m| *m != &user_id) {
                    let session_id = Uuid::now_v7().simple().to_string();
                    store::files::create(
                        &self.pool,
                        &session_id,
                        &payload.file_name,
                        payload.file_size,
                        payload.checksum.as_deref(),
                        &user_id,
                        "user",
                        member,
                    )
                    .await?;
                    let delivered = self
                        .notify(
                            member,
                            Command::FileRequest,
                            json!({
                                "session_id": session_id,
                                "from_user": user_id,
                                "target": {"type": "room", "id": room_id},
                                "file_name": payload.file_name,
                                "file_size": payload.file_size,
                                "checksum": payload.checksum,
                            }),
                        )
                        .await;
                    if delivered {
                        sessions.push(json!({"session_id": session_id, "target_id": member}));
                    } else {
                        store::files::update_status(
                            &self.pool,
                            &session_id,
                            FileStatus::Unreachable,
                        )
                        .await?;
                    }
                }
            }
        }

        if sessions.is_empty() {
            return Ok(self.respond(
                msg,
                Command::FileRequestAck,
                json!({
                    "status": Status::NotFound.as_u16(),
                    "error_message": "No recipients available",
                }),
            ));
        }

        // Alias the lone session id for single-recipient transfers.
        let single_session = (sessions.len() == 1).then(|| sessions[0]["session_id"].clone());
        let mut ack = json!({
            "status": Status::Success.as_u16(),
            "sessions": sessions,
            "file_name": payload.file_name,
            "file_size": payload.file_size,
        });
        if payload.target.kind == TargetType::Room {
            ack["room_id"] = json!(payload.target.id);
        }
        if let Some(session_id) = single_session {
            ack["session_id"] = session_id;
        }
        Ok(self.respond(msg, Command::FileRequestAck, ack))
    }

    /// `file/accept`: target only. Provisions a bridge slot and tells
    /// both peers where the data channel lives.
    pub async fn handle_accept(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let session = self.require_session(msg, ctx).await?;
        let user_id = require_user(ctx)?;
        if user_id != session.target_id {
            return Err(ProtocolError::forbidden("Not allowed to accept"));
        }

        store::files::update_status(&self.pool, &session.session_id, FileStatus::Accepted).await?;
        self.bridge
            .prepare_session(&session.session_id, &session.sender_id, &session.target_id);

        let event_payload = json!({
            "session_id": session.session_id,
            "file_name": session.file_name,
            "file_size": session.file_size,
            "channel_host": self.channel_host,
            "channel_port": self.channel_port,
            "target_id": session.target_id,
        });
        self.notify(&session.sender_id, Command::FileAccept, event_payload.clone())
            .await;
        self.notify(&session.target_id, Command::FileAccept, event_payload)
            .await;

        Ok(self.respond(
            msg,
            Command::FileAcceptAck,
            json!({"status": Status::Success.as_u16(), "session_id": session.session_id}),
        ))
    }

    /// `file/reject`: target only; the sender is notified.
    pub async fn handle_reject(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let session = self.require_session(msg, ctx).await?;
        let user_id = require_user(ctx)?;
        if user_id != session.target_id {
            return Err(ProtocolError::forbidden("Not allowed to reject"));
        }

        store::files::update_status(&self.pool, &session.session_id, FileStatus::Rejected).await?;
        self.notify(
            &session.sender_id,
            Command::FileReject,
            json!({"session_id": session.session_id, "from_user": user_id}),
        )
        .await;

        Ok(self.respond(
            msg,
            Command::FileRejectAck,
            json!({"status": Status::Success.as_u16(), "session_id": session.session_id}),
        ))
    }

    /// `file/complete`: either end reports success.
    pub async fn handle_complete(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let session = self.require_session(msg, ctx).await?;
        self.notify_complete(&session.session_id).await;
        Ok(self.respond(
            msg,
            Command::FileComplete,
            json!({"status": Status::Success.as_u16(), "session_id": session.session_id}),
        ))
    }

    /// `file/error`: either end reports failure.
    pub async fn handle_error(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let session = self.require_session(msg, ctx).await?;
        let payload: FileErrorPayload = parse_payload(msg)?;
        let error_message = payload
            .error_message
            .unwrap_or_else(|| "transfer failed".to_string());
        self.notify_error(&session.session_id, &error_message).await;
        Ok(self.respond(
            msg,
            Command::FileError,
            json!({
                "status": Status::Success.as_u16(),
                "session_id": session.session_id,
                "error_message": error_message,
            }),
        ))
    }

    /// Bridge completion callback: mark the session and tell both peers.
    pub async fn notify_complete(&self, session_id: &str) {
        let Ok(Some(session)) = store::files::get(&self.pool, session_id).await else {
            return;
        };
        if let Err(e) =
            store::files::update_status(&self.pool, session_id, FileStatus::Completed).await
        {
            tracing::error!("Failed to mark file session {session_id} completed: {e}");
        }
        let payload = json!({"session_id": session_id, "status": "completed"});
        self.notify(&session.sender_id, Command::FileComplete, payload.clone())
            .await;
        self.notify(&session.target_id, Command::FileComplete, payload)
            .await;
    }

    /// Bridge error callback: mark the session and tell both peers.
    pub async fn notify_error(&self, session_id: &str, error_message: &str) {
        let Ok(Some(session)) = store::files::get(&self.pool, session_id).await else {
            return;
        };
        if let Err(e) = store::files::update_status(&self.pool, session_id, FileStatus::Error).await
        {
            tracing::error!("Failed to mark file session {session_id} errored: {e}");
        }
        let payload = json!({"session_id": session_id, "error_message": error_message});
        self.notify(&session.sender_id, Command::FileError, payload.clone())
            .await;
        self.notify(&session.target_id, Command::FileError, payload)
            .await;
    }

    /// Fetch the session named by the payload and check the requester is a
    /// participant.
    async fn require_session(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<FileSession> {
        let user_id = require_user(ctx)?;
        let payload: SessionIdPayload = parse_payload(msg)?;
        let session = store::files::get(&self.pool, &payload.session_id)
            .await?
            .ok_or_else(|| ProtocolError::not_found("File session not found"))?;
        if user_id != session.sender_id && user_id != session.target_id {
            return Err(ProtocolError::forbidden("Not participant of session"));
        }
        Ok(session)
    }

    async fn notify(&self, user_id: &str, command: Command, payload: Value) -> bool {
        let event = Envelope::event(command, payload);
        self.registry.send_to_user(user_id, &event).await
    }

    fn respond(&self, request: &Envelope, command: Command, payload: Value) -> Envelope {
        Envelope::response_to(request, command.as_str(), payload)
    }
}
