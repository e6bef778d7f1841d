use std::sync::Arc;

use crate::auth::AuthService;
use crate::commands::Command;
use crate::envelope::Envelope;
use crate::error::ProtocolResult;
use crate::file::FileService;
use crate::friend::FriendService;
use crate::message::MessageService;
use crate::presence::PresenceService;
use crate::registry::ConnectionContext;
use crate::room::RoomService;
use crate::voice::VoiceService;

/// Dispatches decoded frames to the owning service by canonical command.
///
/// Unknown commands are silently ignored; heartbeats are satisfied by the
/// per-frame `last_seen` touch in the server loop and need no handler.
pub struct Router {
    pub auth: Arc<AuthService>,
    pub presence: Arc<PresenceService>,
    pub messages: Arc<MessageService>,
    pub rooms: Arc<RoomService>,
    pub friends: Arc<FriendService>,
    pub files: Arc<FileService>,
    pub voice: Arc<VoiceService>,
}

impl Router {
    pub async fn dispatch(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Option<Envelope>> {
        let Some(command) = Command::parse(&msg.command) else {
            return Ok(None);
        };

        match command {
            Command::AuthRegister => self.auth.handle_register(msg, ctx).await.map(Some),
            Command::AuthLogin => self.auth.handle_login(msg, ctx).await.map(Some),
            Command::AuthLogout => self.auth.handle_logout(msg, ctx).await.map(Some),
            Command::AuthRefresh => self.auth.handle_refresh(msg, ctx).await.map(Some),

            Command::PresenceUpdate => self.presence.handle_update(msg, ctx).await.map(Some),
            Command::PresenceList => self.presence.handle_list(msg, ctx).await.map(Some),
            Command::PresenceHeartbeat => Ok(None),

            Command::MessageSend => self.messages.handle_send(msg, ctx).await.map(Some),

            Command::RoomCreate => self.rooms.handle_create(msg, ctx).await.map(Some),
            Command::RoomJoin => self.rooms.handle_join(msg, ctx).await.map(Some),
            Command::RoomLeave => self.rooms.handle_leave(msg, ctx).await.map(Some),
            Command::RoomList => self.rooms.handle_list(msg, ctx).await.map(Some),
            Command::RoomMembers => self.rooms.handle_members(msg, ctx).await.map(Some),
            Command::RoomInfo => self.rooms.handle_info(msg, ctx).await.map(Some),
            Command::RoomKick => self.rooms.handle_kick(msg, ctx).await.map(Some),
            Command::RoomDelete => self.rooms.handle_delete(msg, ctx).await.map(Some),

            Command::FriendRequest => self.friends.handle_request(msg, ctx).await.map(Some),
            Command::FriendAccept => self.friends.handle_accept(msg, ctx).await.map(Some),
            Command::FriendReject => self.friends.handle_reject(msg, ctx).await.map(Some),
            Command::FriendDelete => self.friends.handle_delete(msg, ctx).await.map(Some),
            Command::FriendList => self.friends.handle_list(msg, ctx).await.map(Some),

            Command::FileRequest => self.files.handle_request(msg, ctx).await.map(Some),
            Command::FileAccept => self.files.handle_accept(msg, ctx).await.map(Some),
            Command::FileReject => self.files.handle_reject(msg, ctx).await.map(Some),
            Command::FileComplete => self.files.handle_complete(msg, ctx).await.map(Some),
            Command::FileError => self.files.handle_error(msg, ctx).await.map(Some),

            Command::VoiceCall => self.voice.handle_call(msg, ctx).await.map(Some),
            Command::VoiceAnswer => self.voice.handle_answer(msg, ctx).await.map(Some),
            Command::VoiceReject => self.voice.handle_reject(msg, ctx).await.map(Some),
            Command::VoiceEnd => self.voice.handle_end(msg, ctx).await.map(Some),
            Command::VoiceData => self.voice.handle_data(msg, ctx).await,

            // Acks and events originate server-side; a client echoing one
            // back gets no reply.
            _ => Ok(None),
        }
    }
}
