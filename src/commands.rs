/// Canonical command strings shared with clients.
///
/// Commands are grouped by domain prefix (`auth/`, `presence/`, `message/`,
/// `room/`, `file/`, `voice/`, `friend/`). Unknown strings fail to parse and
/// are silently ignored by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Auth
    AuthLogin,
    AuthLoginAck,
    AuthRegister,
    AuthRegisterAck,
    AuthLogout,
    AuthRefresh,
    AuthRefreshAck,

    // Presence
    PresenceHeartbeat,
    PresenceUpdate,
    PresenceList,
    PresenceEvent,

    // Messaging
    MessageSend,
    MessageAck,
    MessageEvent,

    // File transfer
    FileRequest,
    FileRequestAck,
    FileAccept,
    FileAcceptAck,
    FileReject,
    FileRejectAck,
    FileComplete,
    FileError,

    // Rooms
    RoomCreate,
    RoomJoin,
    RoomLeave,
    RoomList,
    RoomMembers,
    RoomInfo,
    RoomKick,
    RoomDelete,

    // Voice
    VoiceCall,
    VoiceCallAck,
    VoiceAnswer,
    VoiceAnswerAck,
    VoiceReject,
    VoiceRejectAck,
    VoiceEnd,
    VoiceEndAck,
    VoiceData,
    VoiceEvent,

    // Friends
    FriendRequest,
    FriendRequestAck,
    FriendAccept,
    FriendAcceptAck,
    FriendReject,
    FriendRejectAck,
    FriendDelete,
    FriendDeleteAck,
    FriendList,
    FriendListAck,
    FriendEvent,
}

impl Command {
    pub fn parse(text: &str) -> Option<Self> {
        let command = match text {
            "auth/login" => Self::AuthLogin,
            "auth/login_ack" => Self::AuthLoginAck,
            "auth/register" => Self::AuthRegister,
            "auth/register_ack" => Self::AuthRegisterAck,
            "auth/logout" => Self::AuthLogout,
            "auth/refresh" => Self::AuthRefresh,
            "auth/refresh_ack" => Self::AuthRefreshAck,
            "presence/heartbeat" => Self::PresenceHeartbeat,
            "presence/update" => Self::PresenceUpdate,
            "presence/list" => Self::PresenceList,
            "presence/event" => Self::PresenceEvent,
            "message/send" => Self::MessageSend,
            "message/ack" => Self::MessageAck,
            "message/event" => Self::MessageEvent,
            "file/request" => Self::FileRequest,
            "file/request_ack" => Self::FileRequestAck,
            "file/accept" => Self::FileAccept,
            "file/accept_ack" => Self::FileAcceptAck,
            "file/reject" => Self::FileReject,
            "file/reject_ack" => Self::FileRejectAck,
            "file/complete" => Self::FileComplete,
            "file/error" => Self::FileError,
            "room/create" => Self::RoomCreate,
            "room/join" => Self::RoomJoin,
            "room/leave" => Self::RoomLeave,
            "room/list" => Self::RoomList,
            "room/members" => Self::RoomMembers,
            "room/info" => Self::RoomInfo,
            "room/kick" => Self::RoomKick,
            "room/delete" => Self::RoomDelete,
            "voice/call" => Self::VoiceCall,
            "voice/call_ack" => Self::VoiceCallAck,
            "voice/answer" => Self::VoiceAnswer,
            "voice/answer_ack" => Self::VoiceAnswerAck,
            "voice/reject" => Self::VoiceReject,
            "voice/reject_ack" => Self::VoiceRejectAck,
            "voice/end" => Self::VoiceEnd,
            "voice/end_ack" => Self::VoiceEndAck,
            "voice/data" => Self::VoiceData,
            "voice/event" => Self::VoiceEvent,
            "friend/request" => Self::FriendRequest,
            "friend/request_ack" => Self::FriendRequestAck,
            "friend/accept" => Self::FriendAccept,
            "friend/accept_ack" => Self::FriendAcceptAck,
            "friend/reject" => Self::FriendReject,
            "friend/reject_ack" => Self::FriendRejectAck,
            "friend/delete" => Self::FriendDelete,
            "friend/delete_ack" => Self::FriendDeleteAck,
            "friend/list" => Self::FriendList,
            "friend/list_ack" => Self::FriendListAck,
            "friend/event" => Self::FriendEvent,
            _ => return None,
        };
        Some(command)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthLogin => "auth/login",
            Self::AuthLoginAck => "auth/login_ack",
            Self::AuthRegister => "auth/register",
            Self::AuthRegisterAck => "auth/register_ack",
            Self::AuthLogout => "auth/logout",
            Self::AuthRefresh => "auth/refresh",
            Self::AuthRefreshAck => "auth/refresh_ack",
            Self::PresenceHeartbeat => "presence/heartbeat",
            Self::PresenceUpdate => "presence/update",
            Self::PresenceList => "presence/list",
            Self::PresenceEvent => "presence/event",
            Self::MessageSend => "message/send",
            Self::MessageAck => "message/ack",
            Self::MessageEvent => "message/event",
            Self::FileRequest => "file/request",
            Self::FileRequestAck => "file/request_ack",
            Self::FileAccept => "file/accept",
            Self::FileAcceptAck => "file/accept_ack",
            Self::FileReject => "file/reject",
            Self::FileRejectAck => "file/reject_ack",
            Self::FileComplete => "file/complete",
            Self::FileError => "file/error",
            Self::RoomCreate => "room/create",
            Self::RoomJoin => "room/join",
            Self::RoomLeave => "room/leave",
            Self::RoomList => "room/list",
            Self::RoomMembers => "room/members",
            Self::RoomInfo => "room/info",
            Self::RoomKick => "room/kick",
            Self::RoomDelete => "room/delete",
            Self::VoiceCall => "voice/call",
            Self::VoiceCallAck => "voice/call_ack",
            Self::VoiceAnswer => "voice/answer",
            Self::VoiceAnswerAck => "voice/answer_ack",
            Self::VoiceReject => "voice/reject",
            Self::VoiceRejectAck => "voice/reject_ack",
            Self::VoiceEnd => "voice/end",
            Self::VoiceEndAck => "voice/end_ack",
            Self::VoiceData => "voice/data",
            Self::VoiceEvent => "voice/event",
            Self::FriendRequest => "friend/request",
            Self::FriendRequestAck => "friend/request_ack",
            Self::FriendAccept => "friend/accept",
            Self::FriendAcceptAck => "friend/accept_ack",
            Self::FriendReject => "friend/reject",
            Self::FriendRejectAck => "friend/reject_ack",
            Self::FriendDelete => "friend/delete",
            Self::FriendDeleteAck => "friend/delete_ack",
            Self::FriendList => "friend/list",
            Self::FriendListAck => "friend/list_ack",
            Self::FriendEvent => "friend/event",
        }
    }
}

/// Command to answer with when a handler raises a protocol error.
///
/// Requests whose clients block on a dedicated ack get the paired ack
/// command; everything else echoes the original command string.
pub fn error_ack_command(command: &str) -> &str {
    match Command::parse(command) {
        Some(Command::AuthLogin) => Command::AuthLoginAck.as_str(),
        Some(Command::AuthRefresh) => Command::AuthRefreshAck.as_str(),
        Some(Command::MessageSend) => Command::MessageAck.as_str(),
        _ => command,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_canonical_strings() {
        for text in [
            "auth/login",
            "presence/heartbeat",
            "message/send",
            "room/kick",
            "file/request_ack",
            "voice/data",
            "friend/event",
        ] {
            let command = Command::parse(text).unwrap();
            assert_eq!(command.as_str(), text);
        }
    }

    #[test]
    fn unknown_commands_do_not_parse() {
        assert!(Command::parse("auth/unknown").is_none());
        assert!(Command::parse("").is_none());
    }

    #[test]
    fn error_ack_mapping() {
        assert_eq!(error_ack_command("auth/login"), "auth/login_ack");
        assert_eq!(error_ack_command("auth/refresh"), "auth/refresh_ack");
        assert_eq!(error_ack_command("message/send"), "message/ack");
        assert_eq!(error_ack_command("room/create"), "room/create");
        assert_eq!(error_ack_command("no/such"), "no/such");
    }
}
