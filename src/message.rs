use std::sync::Arc;

use serde_json::json;

use crate::auth::require_user;
use crate::commands::Command;
use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult, Status};
use crate::models::{MessageSendPayload, TargetType};
use crate::registry::{ConnectionContext, ConnectionRegistry};
use crate::store::{self, DbPool};
use crate::validator::parse_payload;

/// Upper bound for a serialized message content object. The frame cap
/// already bounds the whole envelope; this keeps single messages sane.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// Validate message content before storing/fanning out.
pub fn validate_content(content: &serde_json::Value) -> ProtocolResult<()> {
    if content.is_null() {
        return Err(ProtocolError::bad_request("Message content cannot be empty"));
    }
    let size = serde_json::to_string(content).map(|s| s.len()).unwrap_or(0);
    if size > MAX_CONTENT_BYTES {
        return Err(ProtocolError::bad_request(format!(
            "Message content exceeds maximum size of {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(())
}

pub struct MessageService {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
}

impl MessageService {
    pub fn new(pool: DbPool, registry: Arc<ConnectionRegistry>) -> Self {
        Self { pool, registry }
    }

    /// `message/send`: persist, ack, then fan out with the
    /// direct-or-enqueue rule per recipient.
    pub async fn handle_send(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let sender_id = require_user(ctx)?;
        let payload: MessageSendPayload = parse_payload(msg)?;
        if payload.conversation_id.is_empty() {
            return Err(ProtocolError::bad_request("Missing conversation_id"));
        }
        validate_content(&payload.content)?;

        // Resolve recipients up front so authorization failures precede
        // the insert.
        let recipients: Vec<String> = match payload.target.kind {
            TargetType::User => vec![payload.target.id.clone()],
            TargetType::Room => {
                let room_id = &payload.target.id;
                if !store::rooms::exists(&self.pool, room_id).await? {
                    return Err(ProtocolError::not_found("Room not found"));
                }
                let members = store::rooms::list_members(&self.pool, room_id).await?;
                if !members.iter().any(|m| m == &sender_id) {
                    return Err(ProtocolError::forbidden("Sender not in room"));
                }
                members.into_iter().filter(|m| m != &sender_id).collect()
            }
        };

        let stored = store::messages::insert(
            &self.pool,
            &payload.conversation_id,
            &sender_id,
            &payload.content,
        )
        .await?;

        let mut event = Envelope::event(
            Command::MessageEvent,
            json!({
                "conversation_id": stored.conversation_id,
                "sender_id": stored.sender_id,
                "content": stored.content,
                "message_id": stored.message_id,
            }),
        );
        event.id = stored.message_id.clone();
        event.timestamp = stored.timestamp;

        for recipient in &recipients {
            self.deliver(recipient, &event).await?;
        }

        Ok(Envelope::response_to(
            msg,
            Command::MessageAck.as_str(),
            json!({
                "status": Status::Success.as_u16(),
                "message_id": stored.message_id,
            }),
        ))
    }

    /// Live delivery, falling back to the recipient's offline queue.
    async fn deliver(&self, user_id: &str, event: &Envelope) -> ProtocolResult<bool> {
        let delivered = self.registry.send_to_user(user_id, event).await;
        if !delivered {
            store::offline::enqueue(&self.pool, user_id, event).await?;
        }
        Ok(delivered)
    }
}
