use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::auth::require_user;
use crate::commands::Command;
use crate::envelope::{unix_now, Envelope};
use crate::error::{ProtocolResult, Status};
use crate::models::{CallIdPayload, TargetType, VoiceCallPayload, VoiceDataPayload};
use crate::registry::{ConnectionContext, ConnectionRegistry};
use crate::store::{self, DbPool};
use crate::validator::parse_payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
}

/// One active voice call. Audio frames are opaque to the server; it only
/// tracks the participant set and the ringing→connected→ended lifecycle.
#[derive(Debug, Clone)]
pub struct VoiceCall {
    pub call_id: String,
    pub initiator: String,
    pub call_type: String,
    pub target_type: String,
    pub target_id: String,
    pub status: CallStatus,
    /// Join order preserved; membership checked by value.
    pub participants: Vec<String>,
    pub created_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl VoiceCall {
    fn new(
        call_id: String,
        initiator: String,
        call_type: String,
        target_type: String,
        target_id: String,
    ) -> Self {
        Self {
            participants: vec![initiator.clone()],
            call_id,
            initiator,
            call_type,
            target_type,
            target_id,
            status: CallStatus::Ringing,
            created_at: unix_now(),
            connected_at: None,
            ended_at: None,
        }
    }

    fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

#[derive(Default)]
struct VoiceState {
    active_calls: HashMap<String, VoiceCall>,
    user_to_call: HashMap<String, String>,
}

enum EndResult {
    NotFound,
    NotParticipant,
    Done,
}

/// In-memory voice-call signaling and audio-frame relay.
pub struct VoiceService {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<VoiceState>,
}

impl VoiceService {
    pub fn new(pool: DbPool, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            pool,
            registry,
            state: Mutex::new(VoiceState::default()),
        }
    }

    /// `voice/call`: create a ringing call and notify the target(s).
    /// A user may be in at most one non-ended call.
    pub async fn handle_call(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: VoiceCallPayload = parse_payload(msg)?;
        let target_type = match payload.target.kind {
            TargetType::User => "user",
            TargetType::Room => "room",
        };

        let call_id = msg.id.clone();
        {
            let mut state = self.state.lock().await;
            if state.user_to_call.contains_key(&user_id) {
                return Ok(error_response(msg, Status::Conflict, "Already in a call"));
            }
            let call = VoiceCall::new(
                call_id.clone(),
                user_id.clone(),
                payload.call_type.clone(),
                target_type.to_string(),
                payload.target.id.clone(),
            );
            state.user_to_call.insert(user_id.clone(), call_id.clone());
            state.active_calls.insert(call_id.clone(), call);
        }

        tracing::info!(
            "User {user_id} initiated {} call {call_id} to {target_type}:{}",
            payload.call_type,
            payload.target.id
        );

        match payload.target.kind {
            TargetType::User => {
                self.notify(
                    &payload.target.id,
                    json!({
                        "event_type": "incoming",
                        "call_id": call_id,
                        "from_user": user_id,
                        "call_type": payload.call_type,
                        "target": payload.target,
                    }),
                )
                .await;
            }
            TargetType::Room => {
                let members = store::rooms::list_members(&self.pool, &payload.target.id).await?;
                for member in members.iter().filter(|m| *m != &user_id) {
                    self.notify(
                        member,
                        json!({
                            "event_type": "incoming",
                            "call_id": call_id,
                            "from_user": user_id,
                            "call_type": "group",
                            "target": payload.target,
                        }),
                    )
                    .await;
                }
            }
        }

        Ok(Envelope::response_to(
            msg,
            Command::VoiceCallAck.as_str(),
            json!({
                "status": Status::Success.as_u16(),
                "call_id": call_id,
                "message": "Call initiated",
            }),
        ))
    }

    /// `voice/answer`: join the call. Direct calls accept only while
    /// ringing; group calls accept joins any time before the call ends.
    pub async fn handle_answer(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: CallIdPayload = parse_payload(msg)?;

        let (was_ringing, members) = {
            let mut state = self.state.lock().await;
            let Some(call) = state.active_calls.get_mut(&payload.call_id) else {
                return Ok(error_response(msg, Status::NotFound, "Call not found"));
            };
            if call.call_type == "direct" && call.status != CallStatus::Ringing {
                return Ok(error_response(
                    msg,
                    Status::Conflict,
                    "Call already answered or ended",
                ));
            }
            if call.call_type == "group" && call.status == CallStatus::Ended {
                return Ok(error_response(msg, Status::Conflict, "Call has ended"));
            }

            let was_ringing = call.status == CallStatus::Ringing;
            if !call.has_participant(&user_id) {
                call.participants.push(user_id.clone());
            }
            if was_ringing {
                call.status = CallStatus::Connected;
                call.connected_at = Some(unix_now());
            }
            let members = call.participants.clone();
            state
                .user_to_call
                .insert(user_id.clone(), payload.call_id.clone());
            (was_ringing, members)
        };

        tracing::info!(
            "User {user_id} joined call {}, total participants: {}",
            payload.call_id,
            members.len()
        );

        let event_type = if was_ringing { "connected" } else { "member_joined" };
        for participant in &members {
            self.notify(
                participant,
                json!({
                    "event_type": event_type,
                    "call_id": payload.call_id,
                    "user_id": user_id,
                    "members": members,
                }),
            )
            .await;
        }

        Ok(Envelope::response_to(
            msg,
            Command::VoiceAnswerAck.as_str(),
            json!({
                "status": Status::Success.as_u16(),
                "call_id": payload.call_id,
                "message": "Call connected",
            }),
        ))
    }

    /// `voice/reject`: notify the initiator; a direct call ends here.
    pub async fn handle_reject(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: CallIdPayload = parse_payload(msg)?;

        let initiator = {
            let mut state = self.state.lock().await;
            let Some(call) = state.active_calls.get(&payload.call_id) else {
                return Ok(error_response(msg, Status::NotFound, "Call not found"));
            };
            let initiator = call.initiator.clone();
            if call.call_type == "direct" {
                cleanup_call(&mut state, &payload.call_id);
            }
            initiator
        };

        tracing::info!("User {user_id} rejected call {}", payload.call_id);

        self.notify(
            &initiator,
            json!({
                "event_type": "rejected",
                "call_id": payload.call_id,
                "by_user": user_id,
            }),
        )
        .await;

        Ok(Envelope::response_to(
            msg,
            Command::VoiceRejectAck.as_str(),
            json!({"status": Status::Success.as_u16(), "call_id": payload.call_id}),
        ))
    }

    /// `voice/end`: participant only. Group calls with members left get a
    /// `member_left`; the last leaver (or either end of a direct call)
    /// triggers the `ended` broadcast to every pre-removal participant.
    pub async fn handle_end(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: CallIdPayload = parse_payload(msg)?;

        match self.end_for(&user_id, &payload.call_id).await {
            EndResult::NotFound => Ok(error_response(msg, Status::NotFound, "Call not found")),
            EndResult::NotParticipant => {
                Ok(error_response(msg, Status::Forbidden, "Not in this call"))
            }
            EndResult::Done => Ok(Envelope::response_to(
                msg,
                Command::VoiceEndAck.as_str(),
                json!({"status": Status::Success.as_u16(), "call_id": payload.call_id}),
            )),
        }
    }

    /// `voice/data`: fire-and-forget audio frame relay. Forwarded
    /// verbatim to every other participant; non-participants are dropped
    /// silently and no response is generated.
    pub async fn handle_data(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Option<Envelope>> {
        let Some(user_id) = ctx.user_id() else {
            return Ok(None);
        };
        let Ok(payload) = parse_payload::<VoiceDataPayload>(msg) else {
            return Ok(None);
        };

        let others: Vec<String> = {
            let state = self.state.lock().await;
            let Some(call) = state.active_calls.get(&payload.call_id) else {
                return Ok(None);
            };
            if !call.has_participant(&user_id) {
                return Ok(None);
            }
            call.participants
                .iter()
                .filter(|p| *p != &user_id)
                .cloned()
                .collect()
        };

        let event = Envelope::event(Command::VoiceData, msg.payload.clone());
        for participant in &others {
            self.registry.send_to_user(participant, &event).await;
        }
        Ok(None)
    }

    /// Disconnect hook: a vanished participant is treated as having ended
    /// the call.
    pub async fn user_disconnected(&self, user_id: &str) {
        let call_id = {
            let state = self.state.lock().await;
            state.user_to_call.get(user_id).cloned()
        };
        if let Some(call_id) = call_id {
            tracing::info!("User {user_id} disconnected, ending call {call_id}");
            self.end_for(user_id, &call_id).await;
        }
    }

    async fn end_for(&self, user_id: &str, call_id: &str) -> EndResult {
        enum Broadcast {
            MemberLeft { remaining: Vec<String> },
            Ended { recipients: Vec<String>, payload: Value },
        }

        let broadcast = {
            let mut state = self.state.lock().await;
            let Some(call) = state.active_calls.get_mut(call_id) else {
                return EndResult::NotFound;
            };
            if !call.has_participant(user_id) {
                return EndResult::NotParticipant;
            }

            let all_participants = call.participants.clone();
            call.participants.retain(|p| p != user_id);
            let remaining = call.participants.clone();
            let is_group = call.call_type == "group";
            let connected_at = call.connected_at;
            let call_type = call.call_type.clone();
            let target_type = call.target_type.clone();
            let target_id = call.target_id.clone();
            let initiator = call.initiator.clone();

            state.user_to_call.remove(user_id);

            if is_group && !remaining.is_empty() {
                Broadcast::MemberLeft { remaining }
            } else {
                let duration = connected_at
                    .map(|connected| (unix_now() - connected).max(0))
                    .unwrap_or(0);
                let payload = json!({
                    "event_type": "ended",
                    "call_id": call_id,
                    "call_type": call_type,
                    "target_type": target_type,
                    "target_id": target_id,
                    "participants": all_participants,
                    "duration": duration,
                    "initiator": initiator,
                });
                cleanup_call(&mut state, call_id);
                Broadcast::Ended {
                    recipients: all_participants,
                    payload,
                }
            }
        };

        match broadcast {
            Broadcast::MemberLeft { remaining } => {
                for participant in &remaining {
                    self.notify(
                        participant,
                        json!({
                            "event_type": "member_left",
                            "call_id": call_id,
                            "user_id": user_id,
                            "members": remaining,
                        }),
                    )
                    .await;
                }
            }
            Broadcast::Ended {
                recipients,
                payload,
            } => {
                for participant in &recipients {
                    self.notify(participant, payload.clone()).await;
                }
                tracing::info!("Call {call_id} has been cleaned up");
            }
        }
        EndResult::Done
    }

    async fn notify(&self, user_id: &str, payload: Value) {
        let event = Envelope::event(Command::VoiceEvent, payload);
        if !self.registry.send_to_user(user_id, &event).await {
            tracing::debug!("Voice event for {user_id} not delivered (offline)");
        }
    }
}

fn error_response(request: &Envelope, status: Status, message: &str) -> Envelope {
    Envelope::response_to(
        request,
        &request.command,
        json!({"status": status.as_u16(), "error_message": message}),
    )
}

/// Mark the call ended and drop every trace of it from both maps.
fn cleanup_call(state: &mut VoiceState, call_id: &str) {
    if let Some(mut call) = state.active_calls.remove(call_id) {
        call.status = CallStatus::Ended;
        call.ended_at = Some(unix_now());
        for participant in &call.participants {
            if state.user_to_call.get(participant).map(String::as_str) == Some(call_id) {
                state.user_to_call.remove(participant);
            }
        }
    }
}
