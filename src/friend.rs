use std::sync::Arc;

use serde_json::{json, Value};

use crate::auth::require_user;
use crate::commands::Command;
use crate::envelope::Envelope;
use crate::error::{ProtocolResult, Status};
use crate::models::{FriendDeletePayload, FriendRequestPayload, RequestIdPayload};
use crate::registry::{ConnectionContext, ConnectionRegistry};
use crate::store::{self, DbPool};
use crate::validator::parse_payload;

/// Friend graph workflow: requests, acceptance, and bidirectional event
/// pushes to the counterpart.
pub struct FriendService {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
}

impl FriendService {
    pub fn new(pool: DbPool, registry: Arc<ConnectionRegistry>) -> Self {
        Self { pool, registry }
    }

    pub async fn handle_request(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: FriendRequestPayload = parse_payload(msg)?;
        let target_id = payload.target_id;

        if target_id == user_id {
            return Ok(self.error_response(
                msg,
                Status::BadRequest,
                "Cannot send friend request to yourself",
            ));
        }
        if !store::users::exists(&self.pool, &target_id).await? {
            return Ok(self.error_response(msg, Status::NotFound, "User not found"));
        }
        if store::friends::are_friends(&self.pool, &user_id, &target_id).await? {
            return Ok(self.error_response(msg, Status::Conflict, "Already friends"));
        }

        let message = payload.message.unwrap_or_default();
        let request_id =
            store::friends::send_request(&self.pool, &user_id, &target_id, Some(&message)).await?;

        tracing::info!("User {user_id} sent friend request to {target_id}");

        self.notify(
            &target_id,
            json!({
                "event_type": "new_request",
                "from_user": user_id,
                "request_id": request_id,
                "message": message,
            }),
        )
        .await;

        Ok(self.ok_response(
            msg,
            Command::FriendRequestAck,
            json!({"request_id": request_id, "message": "Friend request sent"}),
        ))
    }

    pub async fn handle_accept(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: RequestIdPayload = parse_payload(msg)?;

        // Only the addressee of a still-pending request may accept.
        let pending = store::friends::pending_requests(&self.pool, &user_id).await?;
        let Some(request) = pending.into_iter().find(|r| r.id == payload.request_id) else {
            return Ok(self.error_response(
                msg,
                Status::NotFound,
                "Friend request not found or already processed",
            ));
        };

        if !store::friends::accept_request(&self.pool, payload.request_id).await? {
            return Ok(self.error_response(
                msg,
                Status::Internal,
                "Failed to accept friend request",
            ));
        }

        tracing::info!("User {user_id} accepted friend request from {}", request.from_user);

        self.notify(
            &request.from_user,
            json!({
                "event_type": "request_accepted",
                "user_id": user_id,
                "request_id": payload.request_id,
            }),
        )
        .await;

        Ok(self.ok_response(
            msg,
            Command::FriendAcceptAck,
            json!({"friend_id": request.from_user, "message": "Friend request accepted"}),
        ))
    }

    pub async fn handle_reject(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: RequestIdPayload = parse_payload(msg)?;

        let pending = store::friends::pending_requests(&self.pool, &user_id).await?;
        let Some(request) = pending.into_iter().find(|r| r.id == payload.request_id) else {
            return Ok(self.error_response(
                msg,
                Status::NotFound,
                "Friend request not found or already processed",
            ));
        };

        if !store::friends::reject_request(&self.pool, payload.request_id).await? {
            return Ok(self.error_response(
                msg,
                Status::Internal,
                "Failed to reject friend request",
            ));
        }

        self.notify(
            &request.from_user,
            json!({
                "event_type": "request_rejected",
                "user_id": user_id,
                "request_id": payload.request_id,
            }),
        )
        .await;

        Ok(self.ok_response(
            msg,
            Command::FriendRejectAck,
            json!({"message": "Friend request rejected"}),
        ))
    }

    pub async fn handle_delete(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: FriendDeletePayload = parse_payload(msg)?;

        if !store::friends::are_friends(&self.pool, &user_id, &payload.friend_id).await? {
            return Ok(self.error_response(msg, Status::NotFound, "Not friends"));
        }
        if !store::friends::delete_friend(&self.pool, &user_id, &payload.friend_id).await? {
            return Ok(self.error_response(msg, Status::Internal, "Failed to delete friend"));
        }

        tracing::info!("User {user_id} deleted friend {}", payload.friend_id);

        self.notify(
            &payload.friend_id,
            json!({"event_type": "friend_deleted", "user_id": user_id}),
        )
        .await;

        Ok(self.ok_response(
            msg,
            Command::FriendDeleteAck,
            json!({"message": "Friend deleted"}),
        ))
    }

    pub async fn handle_list(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;

        let friends = store::friends::list_friends(&self.pool, &user_id).await?;
        let pending = store::friends::pending_requests(&self.pool, &user_id).await?;
        let sent = store::friends::sent_requests(&self.pool, &user_id).await?;

        Ok(self.ok_response(
            msg,
            Command::FriendListAck,
            json!({
                "friends": friends,
                "pending_requests": pending,
                "sent_requests": sent,
            }),
        ))
    }

    async fn notify(&self, user_id: &str, payload: Value) {
        let event = Envelope::event(Command::FriendEvent, payload);
        if !self.registry.send_to_user(user_id, &event).await {
            tracing::debug!("Friend event for {user_id} not delivered (offline)");
        }
    }

    fn ok_response(&self, request: &Envelope, command: Command, extra: Value) -> Envelope {
        let mut payload = json!({"status": Status::Success.as_u16()});
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                obj.insert(key.clone(), value.clone());
            }
        }
        Envelope::response_to(request, command.as_str(), payload)
    }

    fn error_response(&self, request: &Envelope, status: Status, message: &str) -> Envelope {
        Envelope::response_to(
            request,
            &request.command,
            json!({"status": status.as_u16(), "error_message": message}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    async fn setup() -> (FriendService, Arc<ConnectionRegistry>, crate::store::DbPool) {
        let pool = test_pool().await;
        let registry = Arc::new(ConnectionRegistry::new());
        crate::store::users::create(&pool, "alice", "h").await.unwrap();
        crate::store::users::create(&pool, "bob", "h").await.unwrap();
        (
            FriendService::new(pool.clone(), Arc::clone(&registry)),
            registry,
            pool,
        )
    }

    #[tokio::test]
    async fn request_accept_creates_friendship() {
        let (friends, registry, pool) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;
        let (bob, _b) = authed_ctx(&registry, "bob").await;

        let request = Envelope::request(
            Command::FriendRequest,
            json!({"target_id": "bob", "message": "hi"}),
        );
        let ack = friends.handle_request(&request, &alice).await.unwrap();
        assert_eq!(ack.command, "friend/request_ack");
        assert_eq!(ack.payload["status"], 200);
        let request_id = ack.payload["request_id"].as_i64().unwrap();

        let accept = Envelope::request(
            Command::FriendAccept,
            json!({"request_id": request_id}),
        );
        let accepted = friends.handle_accept(&accept, &bob).await.unwrap();
        assert_eq!(accepted.payload["status"], 200);
        assert_eq!(accepted.payload["friend_id"], "alice");
        assert!(crate::store::friends::are_friends(&pool, "alice", "bob")
            .await
            .unwrap());

        // Duplicate request once friends conflicts.
        let again = friends.handle_request(&request, &alice).await.unwrap();
        assert_eq!(again.payload["status"], 409);
    }

    #[tokio::test]
    async fn only_the_addressee_may_accept() {
        let (friends, registry, _pool) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;

        let request = Envelope::request(Command::FriendRequest, json!({"target_id": "bob"}));
        let ack = friends.handle_request(&request, &alice).await.unwrap();
        let request_id = ack.payload["request_id"].as_i64().unwrap();

        // The requester is not the addressee: the request is invisible.
        let accept = Envelope::request(
            Command::FriendAccept,
            json!({"request_id": request_id}),
        );
        let denied = friends.handle_accept(&accept, &alice).await.unwrap();
        assert_eq!(denied.payload["status"], 404);
    }

    #[tokio::test]
    async fn request_validation_paths() {
        let (friends, registry, _pool) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;

        let selfish = Envelope::request(Command::FriendRequest, json!({"target_id": "alice"}));
        let denied = friends.handle_request(&selfish, &alice).await.unwrap();
        assert_eq!(denied.payload["status"], 400);

        let stranger = Envelope::request(Command::FriendRequest, json!({"target_id": "nobody"}));
        let missing = friends.handle_request(&stranger, &alice).await.unwrap();
        assert_eq!(missing.payload["status"], 404);
    }

    #[tokio::test]
    async fn reject_delete_and_list() {
        let (friends, registry, pool) = setup().await;
        let (alice, _a) = authed_ctx(&registry, "alice").await;
        let (bob, _b) = authed_ctx(&registry, "bob").await;

        let request = Envelope::request(Command::FriendRequest, json!({"target_id": "bob"}));
        let ack = friends.handle_request(&request, &alice).await.unwrap();
        let request_id = ack.payload["request_id"].as_i64().unwrap();

        let reject = Envelope::request(
            Command::FriendReject,
            json!({"request_id": request_id}),
        );
        let rejected = friends.handle_reject(&reject, &bob).await.unwrap();
        assert_eq!(rejected.payload["status"], 200);

        // Re-request re-opens the same row, then accept and delete.
        let ack = friends.handle_request(&request, &alice).await.unwrap();
        assert_eq!(ack.payload["request_id"].as_i64().unwrap(), request_id);
        let accept = Envelope::request(
            Command::FriendAccept,
            json!({"request_id": request_id}),
        );
        friends.handle_accept(&accept, &bob).await.unwrap();

        let listed = friends
            .handle_list(&Envelope::request(Command::FriendList, json!({})), &bob)
            .await
            .unwrap();
        assert_eq!(listed.command, "friend/list_ack");
        assert_eq!(listed.payload["friends"], json!(["alice"]));

        let delete = Envelope::request(Command::FriendDelete, json!({"friend_id": "alice"}));
        let deleted = friends.handle_delete(&delete, &bob).await.unwrap();
        assert_eq!(deleted.payload["status"], 200);
        assert!(!crate::store::friends::are_friends(&pool, "alice", "bob")
            .await
            .unwrap());

        let again = friends.handle_delete(&delete, &bob).await.unwrap();
        assert_eq!(again.payload["status"], 404);
    }
}
