use std::sync::Arc;

use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::commands::Command;
use crate::envelope::Envelope;
use crate::error::{ErrorCode, ProtocolError, ProtocolResult, Status};
use crate::models::CredentialsPayload;
use crate::presence::broadcast_presence;
use crate::registry::{ConnectionContext, ConnectionRegistry};
use crate::store::{self, DbPool};
use crate::validator::parse_payload;

/// Session token lifetime handed out on login/refresh.
pub const SESSION_TTL_SECONDS: i64 = 3600;

/// Resolve the authenticated user bound to this connection.
pub fn require_user(ctx: &ConnectionContext) -> ProtocolResult<String> {
    ctx.user_id()
        .ok_or_else(|| ProtocolError::unauthorized("Not authenticated"))
}

/// SHA-256 digest rendered as lowercase hex. Clients send password digests
/// on the wire; room passwords are digested server-side before storage.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Mint a fresh 128-bit session token as 32 hex chars.
fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct AuthService {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
    /// Wakeup signal for the offline dispatcher.
    online_tx: mpsc::Sender<String>,
}

impl AuthService {
    pub fn new(
        pool: DbPool,
        registry: Arc<ConnectionRegistry>,
        online_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            pool,
            registry,
            online_tx,
        }
    }

    /// `auth/register`: creates the account only. No token is issued, no
    /// presence change happens; the user comes online through login.
    pub async fn handle_register(
        &self,
        msg: &Envelope,
        _ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let payload: CredentialsPayload = parse_payload(msg)?;
        if payload.username.is_empty() || payload.password.is_empty() {
            return Err(ProtocolError::bad_request("Missing credentials"));
        }

        match store::users::create(&self.pool, &payload.username, &payload.password).await {
            Ok(()) => Ok(auth_ack(
                msg,
                Command::AuthRegisterAck,
                Status::Success,
                "",
                &payload.username,
                0,
                None,
            )),
            Err(e) if e.status == Status::Conflict => Ok(auth_ack(
                msg,
                Command::AuthRegisterAck,
                Status::Conflict,
                "",
                "",
                0,
                Some(("User already exists", Some(ErrorCode::UserExists))),
            )),
            Err(e) => Err(e),
        }
    }

    /// `auth/login`: verify the stored digest, mint a token, bind the
    /// connection, seed presence, and kick the offline drain.
    pub async fn handle_login(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let payload: CredentialsPayload = parse_payload(msg)?;
        if payload.username.is_empty() || payload.password.is_empty() {
            return Err(ProtocolError::bad_request("Missing credentials"));
        }

        let user = store::users::get(&self.pool, &payload.username).await?;
        let valid = user
            .map(|u| u.password_hash == payload.password)
            .unwrap_or(false);
        if !valid {
            return Ok(auth_ack(
                msg,
                Command::AuthLoginAck,
                Status::Unauthorized,
                "",
                "",
                0,
                Some(("Invalid credentials", Some(ErrorCode::InvalidToken))),
            ));
        }

        let token = mint_token();
        store::sessions::upsert(&self.pool, &token, &payload.username, SESSION_TTL_SECONDS).await?;
        ctx.mark_authenticated(&payload.username, &token);
        self.registry.bind_user(ctx);
        store::presence::update(&self.pool, &payload.username, "online").await?;
        self.notify_online(&payload.username);
        broadcast_presence(&self.registry, &payload.username, "online").await;

        tracing::info!("User {} logged in from {}", payload.username, ctx.peer);

        Ok(auth_ack(
            msg,
            Command::AuthLoginAck,
            Status::Success,
            &token,
            &payload.username,
            SESSION_TTL_SECONDS,
            None,
        ))
    }

    /// `auth/logout`: drop the session, unbind, mark offline.
    pub async fn handle_logout(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        if let Some(token) = ctx.token() {
            store::sessions::delete(&self.pool, &token).await?;
        }
        let user_id = ctx.user_id();
        if let Some(user_id) = &user_id {
            self.registry.unbind_user(ctx);
            store::presence::update(&self.pool, user_id, "offline").await?;
        }
        ctx.clear_authentication();

        if let Some(user_id) = &user_id {
            broadcast_presence(&self.registry, user_id, "offline").await;
        }

        Ok(Envelope::response_to(
            msg,
            Command::AuthLogout.as_str(),
            json!({"status": Status::Success.as_u16()}),
        ))
    }

    /// `auth/refresh`: rotate the token for an authenticated connection
    /// and re-trigger the offline drain. Always answers with the refresh
    /// ack so a waiting client completes in every outcome.
    pub async fn handle_refresh(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let (Some(user_id), Some(old_token)) = (ctx.user_id(), ctx.token()) else {
            return Ok(auth_ack(
                msg,
                Command::AuthRefreshAck,
                Status::Unauthorized,
                "",
                "",
                0,
                Some(("Not authenticated", Some(ErrorCode::InvalidToken))),
            ));
        };

        let token = mint_token();
        store::sessions::upsert(&self.pool, &token, &user_id, SESSION_TTL_SECONDS).await?;
        store::sessions::delete(&self.pool, &old_token).await?;
        ctx.mark_authenticated(&user_id, &token);
        self.registry.bind_user(ctx);
        self.notify_online(&user_id);

        Ok(auth_ack(
            msg,
            Command::AuthRefreshAck,
            Status::Success,
            &token,
            &user_id,
            SESSION_TTL_SECONDS,
            None,
        ))
    }

    fn notify_online(&self, user_id: &str) {
        if let Err(e) = self.online_tx.try_send(user_id.to_string()) {
            tracing::warn!("Offline dispatcher wakeup dropped for {user_id}: {e}");
        }
    }
}

/// Shared ack shape for register/login/refresh.
fn auth_ack(
    request: &Envelope,
    command: Command,
    status: Status,
    token: &str,
    user_id: &str,
    expires_in: i64,
    error: Option<(&str, Option<ErrorCode>)>,
) -> Envelope {
    let mut payload: Value = json!({
        "status": status.as_u16(),
        "token": token,
        "user_id": user_id,
        "expires_in": expires_in,
    });
    if let Some((message, code)) = error {
        payload["error_message"] = json!(message);
        if let Some(code) = code {
            payload["error_code"] = json!(code.as_u16());
        }
    }
    Envelope::response_to(request, command.as_str(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::store::test_pool;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("alice"),
            "2bd806c97f0e00af1a1fc3328fa763a9269723c8db8fac4f93af71db186d6e90"
        );
    }

    #[test]
    fn tokens_are_128_bit_hex_and_unique() {
        let a = mint_token();
        let b = mint_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    async fn conn_ctx(registry: &ConnectionRegistry) -> (Arc<ConnectionContext>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let ctx = Arc::new(ConnectionContext::new(registry.next_conn_id(), peer, write));
        registry.register(Arc::clone(&ctx));
        (ctx, client)
    }

    async fn service() -> (AuthService, Arc<ConnectionRegistry>, mpsc::Receiver<String>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let pool = test_pool().await;
        let (tx, rx) = mpsc::channel(16);
        (
            AuthService::new(pool, Arc::clone(&registry), tx),
            registry,
            rx,
        )
    }

    fn creds(user: &str) -> serde_json::Value {
        json!({"username": user, "password": sha256_hex(user)})
    }

    #[tokio::test]
    async fn register_issues_no_token_and_conflicts_on_duplicate() {
        let (auth, registry, _rx) = service().await;
        let (ctx, _keep) = conn_ctx(&registry).await;

        let msg = Envelope::request(Command::AuthRegister, creds("alice"));
        let ack = auth.handle_register(&msg, &ctx).await.unwrap();
        assert_eq!(ack.command, "auth/register_ack");
        assert_eq!(ack.payload["status"], 200);
        assert_eq!(ack.payload["token"], "");
        assert_eq!(ack.payload["user_id"], "alice");
        // Registration alone leaves the connection unbound.
        assert!(!ctx.is_authenticated());
        assert!(!registry.is_online("alice"));

        let again = auth.handle_register(&msg, &ctx).await.unwrap();
        assert_eq!(again.payload["status"], 409);
        assert_eq!(again.payload["error_code"], 1006);
    }

    #[tokio::test]
    async fn login_binds_and_signals_offline_drain() {
        let (auth, registry, mut rx) = service().await;
        let (ctx, _keep) = conn_ctx(&registry).await;

        let register = Envelope::request(Command::AuthRegister, creds("alice"));
        auth.handle_register(&register, &ctx).await.unwrap();

        let login = Envelope::request(Command::AuthLogin, creds("alice"));
        let ack = auth.handle_login(&login, &ctx).await.unwrap();
        assert_eq!(ack.payload["status"], 200);
        assert_eq!(ack.payload["expires_in"], 3600);
        let token = ack.payload["token"].as_str().unwrap();
        assert_eq!(token.len(), 32);
        assert!(registry.is_online("alice"));
        assert_eq!(ctx.token().as_deref(), Some(token));
        assert_eq!(rx.recv().await.as_deref(), Some("alice"));

        // Wrong digest answers on the ack without raising.
        let bad = Envelope::request(
            Command::AuthLogin,
            json!({"username": "alice", "password": sha256_hex("wrong")}),
        );
        let denied = auth.handle_login(&bad, &ctx).await.unwrap();
        assert_eq!(denied.payload["status"], 401);
        assert_eq!(denied.payload["error_code"], 1001);
    }

    #[tokio::test]
    async fn refresh_rotates_token_and_logout_unbinds() {
        let (auth, registry, mut rx) = service().await;
        let (ctx, _keep) = conn_ctx(&registry).await;

        auth.handle_register(&Envelope::request(Command::AuthRegister, creds("bob")), &ctx)
            .await
            .unwrap();
        let login_ack = auth
            .handle_login(&Envelope::request(Command::AuthLogin, creds("bob")), &ctx)
            .await
            .unwrap();
        let first_token = login_ack.payload["token"].as_str().unwrap().to_string();
        rx.recv().await;

        let refresh = Envelope::request(Command::AuthRefresh, json!({}));
        let refreshed = auth.handle_refresh(&refresh, &ctx).await.unwrap();
        assert_eq!(refreshed.command, "auth/refresh_ack");
        assert_eq!(refreshed.payload["status"], 200);
        let second_token = refreshed.payload["token"].as_str().unwrap();
        assert_ne!(second_token, first_token);
        assert_eq!(ctx.token().as_deref(), Some(second_token));
        assert_eq!(rx.recv().await.as_deref(), Some("bob"));

        let logout = Envelope::request(Command::AuthLogout, json!({}));
        let done = auth.handle_logout(&logout, &ctx).await.unwrap();
        assert_eq!(done.command, "auth/logout");
        assert_eq!(done.payload["status"], 200);
        assert!(!ctx.is_authenticated());
        assert!(!registry.is_online("bob"));
    }

    #[tokio::test]
    async fn refresh_without_session_still_acks() {
        let (auth, registry, _rx) = service().await;
        let (ctx, _keep) = conn_ctx(&registry).await;

        let refresh = Envelope::request(Command::AuthRefresh, json!({}));
        let ack = auth.handle_refresh(&refresh, &ctx).await.unwrap();
        assert_eq!(ack.command, "auth/refresh_ack");
        assert_eq!(ack.payload["status"], 401);
        assert_eq!(ack.payload["error_code"], 1001);
    }
}
