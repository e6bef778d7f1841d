use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::framing;
use crate::presence::broadcast_presence;
use crate::registry::{ConnectionContext, ConnectionRegistry};
use crate::router::Router;
use crate::store::{self, DbPool};
use crate::validator;

/// Per-connection teardown hook, used to clean up voice calls.
pub type DisconnectHook =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Control-plane TCP server: accepts connections and runs the
/// read → validate → route → respond loop for each.
pub struct SocketServer {
    listener: TcpListener,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
    pool: DbPool,
    on_disconnect: Option<DisconnectHook>,
}

impl SocketServer {
    pub async fn bind(
        host: &str,
        port: u16,
        router: Arc<Router>,
        registry: Arc<ConnectionRegistry>,
        pool: DbPool,
        on_disconnect: Option<DisconnectHook>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            router,
            registry,
            pool,
            on_disconnect,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_client(stream, peer).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let ctx = Arc::new(ConnectionContext::new(
            self.registry.next_conn_id(),
            peer,
            write_half,
        ));
        self.registry.register(Arc::clone(&ctx));
        tracing::debug!("Connection from {peer}");

        let mut reader = BufReader::new(read_half);
        loop {
            let raw = match framing::read_raw_frame(&mut reader).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::info!("Client {peer} disconnected");
                    break;
                }
                Err(e) => {
                    tracing::info!("Client {peer} connection reset: {e}");
                    break;
                }
            };

            let decoded = framing::decode_frame(&raw);
            let outcome = match &decoded {
                Ok(msg) => self.process(msg, &ctx).await,
                Err(e) => Err(e.clone()),
            };

            let reply = match outcome {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::warn!("Protocol error for {peer}: {error}");
                    let request = decoded.unwrap_or_else(|_| unparsed_request());
                    Some(Envelope::error_response(&request, &error))
                }
            };
            if let Some(reply) = reply {
                if ctx.send(&reply).await.is_err() {
                    break;
                }
            }
        }

        self.teardown(&ctx).await;
    }

    async fn process(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> Result<Option<Envelope>, ProtocolError> {
        validator::validate(msg)?;
        ctx.touch();
        self.router.dispatch(msg, ctx).await
    }

    /// EOF/reset cleanup: voice hook first, then unregister, then an
    /// implicit offline transition unless a newer binding took over.
    async fn teardown(&self, ctx: &Arc<ConnectionContext>) {
        let user_id = ctx.user_id();

        if let (Some(hook), Some(user_id)) = (&self.on_disconnect, &user_id) {
            hook(user_id.clone()).await;
        }

        self.registry.unregister(ctx.conn_id);
        ctx.close().await;

        if let Some(user_id) = user_id {
            if !self.registry.is_online(&user_id) {
                if let Err(e) = store::presence::update(&self.pool, &user_id, "offline").await {
                    tracing::error!("Failed to mark {user_id} offline: {e}");
                }
                broadcast_presence(&self.registry, &user_id, "offline").await;
            }
        }
    }
}

/// Stand-in request for frames that never decoded; the error response then
/// carries empty correlation fields, which is all the client can get.
fn unparsed_request() -> Envelope {
    Envelope {
        id: String::new(),
        kind: crate::envelope::FrameKind::Request,
        timestamp: crate::envelope::unix_now(),
        command: String::new(),
        headers: serde_json::Map::new(),
        payload: serde_json::Value::Null,
    }
}
