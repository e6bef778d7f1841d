use std::sync::Arc;

use serde_json::{json, Value};

use crate::auth::{require_user, sha256_hex};
use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult, Status};
use crate::models::{RoomCreatePayload, RoomIdPayload, RoomJoinPayload, RoomKickPayload};
use crate::registry::ConnectionContext;
use crate::store::{self, DbPool};
use crate::validator::parse_payload;

pub struct RoomService {
    pool: DbPool,
}

impl RoomService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// `room/create`: creator becomes owner and first member; encrypted
    /// rooms require a password, stored only as a hash.
    pub async fn handle_create(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: RoomCreatePayload = parse_payload(msg)?;
        if payload.room_id.is_empty() {
            return Err(ProtocolError::bad_request("Missing room_id"));
        }
        if payload.encrypted && payload.password.is_none() {
            return Err(ProtocolError::bad_request("Encrypted room requires password"));
        }

        let password_hash = payload.password.as_deref().map(sha256_hex);
        let created = store::rooms::create(
            &self.pool,
            &payload.room_id,
            &user_id,
            payload.encrypted,
            password_hash.as_deref(),
            &json!({}),
        )
        .await;
        if let Err(e) = created {
            if e.status == Status::Conflict {
                return Ok(self.respond(
                    msg,
                    json!({
                        "status": Status::Conflict.as_u16(),
                        "room_id": payload.room_id,
                        "error_message": e.message,
                    }),
                ));
            }
            return Err(e);
        }

        let room = store::rooms::get(&self.pool, &payload.room_id).await?;
        let members = store::rooms::list_members(&self.pool, &payload.room_id).await?;
        Ok(self.respond(
            msg,
            json!({
                "status": Status::Success.as_u16(),
                "room_id": payload.room_id,
                "encrypted": payload.encrypted,
                "owner": user_id,
                "created_at": room.map(|r| r.created_at),
                "members": members,
            }),
        ))
    }

    /// `room/join`: password-gated for encrypted rooms; membership insert
    /// is idempotent.
    pub async fn handle_join(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: RoomJoinPayload = parse_payload(msg)?;

        let Some(room) = store::rooms::get(&self.pool, &payload.room_id).await? else {
            return Ok(self.not_found(msg, &payload.room_id));
        };
        if room.encrypted {
            let Some(password) = payload.password.as_deref() else {
                return Err(ProtocolError::forbidden("Password required"));
            };
            if room.password_hash.as_deref() != Some(sha256_hex(password).as_str()) {
                return Ok(self.respond(
                    msg,
                    json!({
                        "status": Status::Forbidden.as_u16(),
                        "room_id": payload.room_id,
                        "error_message": "Invalid password",
                    }),
                ));
            }
        }

        store::rooms::add_member(&self.pool, &payload.room_id, &user_id).await?;
        let members = store::rooms::list_members(&self.pool, &payload.room_id).await?;
        Ok(self.respond(
            msg,
            json!({
                "status": Status::Success.as_u16(),
                "room_id": payload.room_id,
                "encrypted": room.encrypted,
                "owner": room.owner,
                "created_at": room.created_at,
                "members": members,
            }),
        ))
    }

    /// `room/leave`: removes the requester; ownership never changes.
    pub async fn handle_leave(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: RoomIdPayload = parse_payload(msg)?;
        if !store::rooms::exists(&self.pool, &payload.room_id).await? {
            return Ok(self.not_found(msg, &payload.room_id));
        }
        store::rooms::remove_member(&self.pool, &payload.room_id, &user_id).await?;
        Ok(self.respond(
            msg,
            json!({"status": Status::Success.as_u16(), "room_id": payload.room_id}),
        ))
    }

    /// `room/list`: rooms the requester belongs to.
    pub async fn handle_list(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let rooms = store::rooms::list_for_user(&self.pool, &user_id).await?;
        Ok(self.respond(
            msg,
            json!({"status": Status::Success.as_u16(), "rooms": rooms}),
        ))
    }

    pub async fn handle_members(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        require_user(ctx)?;
        let payload: RoomIdPayload = parse_payload(msg)?;
        if !store::rooms::exists(&self.pool, &payload.room_id).await? {
            return Ok(self.not_found(msg, &payload.room_id));
        }
        let members = store::rooms::list_members(&self.pool, &payload.room_id).await?;
        Ok(self.respond(
            msg,
            json!({
                "status": Status::Success.as_u16(),
                "room_id": payload.room_id,
                "members": members,
            }),
        ))
    }

    pub async fn handle_info(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        require_user(ctx)?;
        let payload: RoomIdPayload = parse_payload(msg)?;
        let Some(room) = store::rooms::get(&self.pool, &payload.room_id).await? else {
            return Ok(self.not_found(msg, &payload.room_id));
        };
        let members = store::rooms::list_members(&self.pool, &payload.room_id).await?;
        Ok(self.respond(
            msg,
            json!({
                "status": Status::Success.as_u16(),
                "room_id": payload.room_id,
                "owner": room.owner,
                "created_at": room.created_at,
                "encrypted": room.encrypted,
                "members": members,
            }),
        ))
    }

    /// `room/kick`: owner only; the owner cannot kick themselves.
    pub async fn handle_kick(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: RoomKickPayload = parse_payload(msg)?;

        let Some(room) = store::rooms::get(&self.pool, &payload.room_id).await? else {
            return Ok(self.not_found(msg, &payload.room_id));
        };
        if room.owner != user_id {
            return Ok(self.respond(
                msg,
                json!({
                    "status": Status::Forbidden.as_u16(),
                    "room_id": payload.room_id,
                    "error_message": "Only room owner can kick members",
                }),
            ));
        }
        if payload.user_id == user_id {
            return Ok(self.respond(
                msg,
                json!({
                    "status": Status::BadRequest.as_u16(),
                    "room_id": payload.room_id,
                    "error_message": "Cannot kick yourself",
                }),
            ));
        }

        store::rooms::remove_member(&self.pool, &payload.room_id, &payload.user_id).await?;
        let members = store::rooms::list_members(&self.pool, &payload.room_id).await?;
        Ok(self.respond(
            msg,
            json!({
                "status": Status::Success.as_u16(),
                "room_id": payload.room_id,
                "user_id": payload.user_id,
                "members": members,
            }),
        ))
    }

    /// `room/delete`: owner only; cascades membership removal.
    pub async fn handle_delete(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: RoomIdPayload = parse_payload(msg)?;

        let Some(room) = store::rooms::get(&self.pool, &payload.room_id).await? else {
            return Ok(self.not_found(msg, &payload.room_id));
        };
        if room.owner != user_id {
            return Ok(self.respond(
                msg,
                json!({
                    "status": Status::Forbidden.as_u16(),
                    "room_id": payload.room_id,
                    "error_message": "Only room owner can delete the room",
                }),
            ));
        }

        store::rooms::delete(&self.pool, &payload.room_id).await?;
        Ok(self.respond(
            msg,
            json!({"status": Status::Success.as_u16(), "room_id": payload.room_id}),
        ))
    }

    fn respond(&self, request: &Envelope, payload: Value) -> Envelope {
        Envelope::response_to(request, &request.command, payload)
    }

    fn not_found(&self, request: &Envelope, room_id: &str) -> Envelope {
        self.respond(
            request,
            json!({
                "status": Status::NotFound.as_u16(),
                "room_id": room_id,
                "error_message": "Room not found",
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::registry::ConnectionRegistry;
    use crate::store::test_pool;
    use tokio::net::{TcpListener, TcpStream};

    async fn authed_ctx(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> (Arc<ConnectionContext>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let ctx = Arc::new(ConnectionContext::new(registry.next_conn_id(), peer, write));
        ctx.mark_authenticated(user, "token");
        registry.register(Arc::clone(&ctx));
        (ctx, client)
    }

    async fn setup() -> (RoomService, ConnectionRegistry) {
        (RoomService::new(test_pool().await), ConnectionRegistry::new())
    }

    #[tokio::test]
    async fn create_join_and_conflict() {
        let (rooms, registry) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;
        let (bob, _b) = authed_ctx(&registry, "bob").await;

        let create = Envelope::request(
            Command::RoomCreate,
            json!({"room_id": "r1", "encrypted": false}),
        );
        let created = rooms.handle_create(&create, &alice).await.unwrap();
        assert_eq!(created.payload["status"], 200);
        assert_eq!(created.payload["owner"], "alice");
        assert_eq!(created.payload["members"], json!(["alice"]));

        let conflict = rooms.handle_create(&create, &bob).await.unwrap();
        assert_eq!(conflict.payload["status"], 409);

        let join = Envelope::request(Command::RoomJoin, json!({"room_id": "r1"}));
        let joined = rooms.handle_join(&join, &bob).await.unwrap();
        assert_eq!(joined.payload["status"], 200);
        assert_eq!(joined.payload["members"], json!(["alice", "bob"]));
        assert_eq!(joined.payload["owner"], "alice");

        let listed = rooms
            .handle_list(&Envelope::request(Command::RoomList, json!({})), &bob)
            .await
            .unwrap();
        assert_eq!(listed.payload["rooms"], json!(["r1"]));
    }

    #[tokio::test]
    async fn encrypted_rooms_gate_on_password_hash() {
        let (rooms, registry) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;
        let (bob, _b) = authed_ctx(&registry, "bob").await;

        // Password is mandatory for encrypted rooms.
        let bare = Envelope::request(
            Command::RoomCreate,
            json!({"room_id": "vault", "encrypted": true}),
        );
        assert!(rooms.handle_create(&bare, &alice).await.is_err());

        let create = Envelope::request(
            Command::RoomCreate,
            json!({"room_id": "vault", "encrypted": true, "password": "hunter2"}),
        );
        assert_eq!(
            rooms.handle_create(&create, &alice).await.unwrap().payload["status"],
            200
        );

        let no_password = Envelope::request(Command::RoomJoin, json!({"room_id": "vault"}));
        assert!(rooms.handle_join(&no_password, &bob).await.is_err());

        let wrong = Envelope::request(
            Command::RoomJoin,
            json!({"room_id": "vault", "password": "letmein"}),
        );
        let denied = rooms.handle_join(&wrong, &bob).await.unwrap();
        assert_eq!(denied.payload["status"], 403);

        let right = Envelope::request(
            Command::RoomJoin,
            json!({"room_id": "vault", "password": "hunter2"}),
        );
        let joined = rooms.handle_join(&right, &bob).await.unwrap();
        assert_eq!(joined.payload["status"], 200);
        assert_eq!(joined.payload["encrypted"], true);
    }

    #[tokio::test]
    async fn kick_is_owner_only_and_never_self() {
        let (rooms, registry) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;
        let (bob, _b) = authed_ctx(&registry, "bob").await;

        let create = Envelope::request(
            Command::RoomCreate,
            json!({"room_id": "r1", "encrypted": false}),
        );
        rooms.handle_create(&create, &alice).await.unwrap();
        let join = Envelope::request(Command::RoomJoin, json!({"room_id": "r1"}));
        rooms.handle_join(&join, &bob).await.unwrap();

        let bob_kicks = Envelope::request(
            Command::RoomKick,
            json!({"room_id": "r1", "user_id": "alice"}),
        );
        let denied = rooms.handle_kick(&bob_kicks, &bob).await.unwrap();
        assert_eq!(denied.payload["status"], 403);

        let self_kick = Envelope::request(
            Command::RoomKick,
            json!({"room_id": "r1", "user_id": "alice"}),
        );
        let refused = rooms.handle_kick(&self_kick, &alice).await.unwrap();
        assert_eq!(refused.payload["status"], 400);

        let kick_bob = Envelope::request(
            Command::RoomKick,
            json!({"room_id": "r1", "user_id": "bob"}),
        );
        let kicked = rooms.handle_kick(&kick_bob, &alice).await.unwrap();
        assert_eq!(kicked.payload["status"], 200);
        assert_eq!(kicked.payload["members"], json!(["alice"]));
    }

    #[tokio::test]
    async fn delete_is_owner_only_and_cascades() {
        let (rooms, registry) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;
        let (bob, _b) = authed_ctx(&registry, "bob").await;

        let create = Envelope::request(
            Command::RoomCreate,
            json!({"room_id": "r1", "encrypted": false}),
        );
        rooms.handle_create(&create, &alice).await.unwrap();
        let join = Envelope::request(Command::RoomJoin, json!({"room_id": "r1"}));
        rooms.handle_join(&join, &bob).await.unwrap();

        let delete = Envelope::request(Command::RoomDelete, json!({"room_id": "r1"}));
        let denied = rooms.handle_delete(&delete, &bob).await.unwrap();
        assert_eq!(denied.payload["status"], 403);

        let deleted = rooms.handle_delete(&delete, &alice).await.unwrap();
        assert_eq!(deleted.payload["status"], 200);

        let info = Envelope::request(Command::RoomInfo, json!({"room_id": "r1"}));
        let gone = rooms.handle_info(&info, &alice).await.unwrap();
        assert_eq!(gone.payload["status"], 404);

        let listed = rooms
            .handle_list(&Envelope::request(Command::RoomList, json!({})), &bob)
            .await
            .unwrap();
        assert_eq!(listed.payload["rooms"], json!([]));
    }
}
