use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::envelope::{unix_now, Envelope};
use crate::error::ProtocolResult;
use crate::framing;

#[derive(Debug, Clone)]
struct AuthBinding {
    user_id: String,
    token: String,
}

/// Per-connection state. Lifetime equals the TCP connection; the identity
/// fields are set once the Auth Service binds the user.
pub struct ConnectionContext {
    pub conn_id: u64,
    pub peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    auth: StdMutex<Option<AuthBinding>>,
    last_seen: AtomicI64,
}

impl ConnectionContext {
    pub fn new(conn_id: u64, peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            conn_id,
            peer,
            writer: Mutex::new(writer),
            auth: StdMutex::new(None),
            last_seen: AtomicI64::new(unix_now()),
        }
    }

    pub fn touch(&self) {
        self.last_seen.store(unix_now(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn user_id(&self) -> Option<String> {
        self.auth
            .lock()
            .map(|guard| guard.as_ref().map(|b| b.user_id.clone()))
            .unwrap_or(None)
    }

    pub fn token(&self) -> Option<String> {
        self.auth
            .lock()
            .map(|guard| guard.as_ref().map(|b| b.token.clone()))
            .unwrap_or(None)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }

    /// Bind an authenticated identity to this connection.
    pub fn mark_authenticated(&self, user_id: &str, token: &str) {
        if let Ok(mut guard) = self.auth.lock() {
            *guard = Some(AuthBinding {
                user_id: user_id.to_string(),
                token: token.to_string(),
            });
        }
        self.touch();
    }

    pub fn clear_authentication(&self) {
        if let Ok(mut guard) = self.auth.lock() {
            *guard = None;
        }
    }

    /// Encode and write one frame; outbound frames on a connection are
    /// serialized by the writer lock.
    pub async fn send(&self, envelope: &Envelope) -> ProtocolResult<()> {
        let bytes = framing::encode_frame(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the outbound half; the peer's read loop observes EOF.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Tracks live connections and allows sending events to authenticated
/// users. Two indexes: by transport handle and by bound user id.
#[derive(Default)]
pub struct ConnectionRegistry {
    by_conn: DashMap<u64, Arc<ConnectionContext>>,
    by_user: DashMap<String, Arc<ConnectionContext>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, ctx: Arc<ConnectionContext>) {
        self.by_conn.insert(ctx.conn_id, ctx);
    }

    /// Point the user index at this context. A prior binding for the same
    /// user is displaced (last-login-wins); the displaced connection stays
    /// registered but unbound.
    pub fn bind_user(&self, ctx: &Arc<ConnectionContext>) {
        if let Some(user_id) = ctx.user_id() {
            self.by_user.insert(user_id, Arc::clone(ctx));
        }
    }

    /// Drop the user index entry, but only if it still points at this
    /// context.
    pub fn unbind_user(&self, ctx: &Arc<ConnectionContext>) {
        if let Some(user_id) = ctx.user_id() {
            self.by_user
                .remove_if(&user_id, |_, bound| bound.conn_id == ctx.conn_id);
        }
    }

    pub fn unregister(&self, conn_id: u64) -> Option<Arc<ConnectionContext>> {
        let (_, ctx) = self.by_conn.remove(&conn_id)?;
        self.unbind_user(&ctx);
        Some(ctx)
    }

    pub fn get_by_user(&self, user_id: &str) -> Option<Arc<ConnectionContext>> {
        self.by_user.get(user_id).map(|entry| Arc::clone(&entry))
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }

    /// Snapshot of all currently bound user ids.
    pub fn get_all_users(&self) -> Vec<String> {
        self.by_user.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Deliver one frame to a user's live connection. Returns false when
    /// the user has no binding or the write fails; never raises.
    pub async fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> bool {
        let Some(ctx) = self.get_by_user(user_id) else {
            return false;
        };
        ctx.send(envelope).await.is_ok()
    }

    /// Unregister every context whose `last_seen` predates `cutoff`,
    /// returning the evicted authenticated bindings.
    pub fn cleanup_idle(&self, cutoff: i64) -> Vec<(String, Arc<ConnectionContext>)> {
        let idle: Vec<u64> = self
            .by_conn
            .iter()
            .filter(|entry| entry.value().last_seen() < cutoff)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = Vec::new();
        for conn_id in idle {
            if let Some(ctx) = self.unregister(conn_id) {
                if let Some(user_id) = ctx.user_id() {
                    removed.push((user_id, ctx));
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn context_for(registry: &ConnectionRegistry) -> (Arc<ConnectionContext>, TcpStream) {
        let (client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let (_read, write) = server.into_split();
        let ctx = Arc::new(ConnectionContext::new(registry.next_conn_id(), peer, write));
        registry.register(Arc::clone(&ctx));
        (ctx, client)
    }

    #[tokio::test]
    async fn bind_is_last_login_wins() {
        let registry = ConnectionRegistry::new();
        let (first, _keep1) = context_for(&registry).await;
        let (second, _keep2) = context_for(&registry).await;

        first.mark_authenticated("alice", "t1");
        registry.bind_user(&first);
        second.mark_authenticated("alice", "t2");
        registry.bind_user(&second);

        let bound = registry.get_by_user("alice").unwrap();
        assert_eq!(bound.conn_id, second.conn_id);

        // Unbinding the displaced context must not disturb the newer one.
        registry.unbind_user(&first);
        assert!(registry.is_online("alice"));

        registry.unbind_user(&second);
        assert!(!registry.is_online("alice"));
    }

    #[tokio::test]
    async fn unregister_clears_matching_binding() {
        let registry = ConnectionRegistry::new();
        let (ctx, _keep) = context_for(&registry).await;
        ctx.mark_authenticated("bob", "tok");
        registry.bind_user(&ctx);

        let removed = registry.unregister(ctx.conn_id).unwrap();
        assert_eq!(removed.conn_id, ctx.conn_id);
        assert!(!registry.is_online("bob"));
        assert!(registry.unregister(ctx.conn_id).is_none());
    }

    #[tokio::test]
    async fn send_to_user_writes_one_frame() {
        let registry = ConnectionRegistry::new();
        let (ctx, client) = context_for(&registry).await;
        ctx.mark_authenticated("bob", "tok");
        registry.bind_user(&ctx);

        let event = Envelope::event(Command::PresenceEvent, json!({"user_id": "alice"}));
        assert!(registry.send_to_user("bob", &event).await);
        assert!(!registry.send_to_user("nobody", &event).await);

        let mut line = String::new();
        let mut reader = BufReader::new(client);
        reader.read_line(&mut line).await.unwrap();
        let received: Envelope = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(received.command, "presence/event");
    }

    #[tokio::test]
    async fn cleanup_idle_evicts_stale_contexts() {
        let registry = ConnectionRegistry::new();
        let (stale, _keep1) = context_for(&registry).await;
        let (fresh, _keep2) = context_for(&registry).await;
        stale.mark_authenticated("alice", "t1");
        registry.bind_user(&stale);
        fresh.mark_authenticated("bob", "t2");
        registry.bind_user(&fresh);

        stale
            .last_seen
            .store(unix_now() - 120, Ordering::Relaxed);

        let removed = registry.cleanup_idle(unix_now() - 30);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "alice");
        assert!(!registry.is_online("alice"));
        assert!(registry.is_online("bob"));
        assert_eq!(registry.get_all_users(), ["bob"]);
    }
}
