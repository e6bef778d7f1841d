use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::auth::require_user;
use crate::commands::Command;
use crate::envelope::{unix_now, Envelope};
use crate::error::{ProtocolResult, Status};
use crate::registry::{ConnectionContext, ConnectionRegistry};
use crate::store::{self, DbPool};
use crate::validator::parse_payload;

/// Build a `presence/event` frame for a state change.
pub fn presence_event(user_id: &str, state: &str) -> Envelope {
    Envelope::event(
        Command::PresenceEvent,
        json!({
            "user_id": user_id,
            "state": state,
            "last_seen": unix_now(),
        }),
    )
}

/// Best-effort push of a presence change to every other online user.
pub async fn broadcast_presence(registry: &ConnectionRegistry, user_id: &str, state: &str) {
    let event = presence_event(user_id, state);
    for online_user in registry.get_all_users() {
        if online_user != user_id {
            registry.send_to_user(&online_user, &event).await;
        }
    }
}

pub struct PresenceService {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
}

impl PresenceService {
    pub fn new(pool: DbPool, registry: Arc<ConnectionRegistry>) -> Self {
        Self { pool, registry }
    }

    /// `presence/update`: explicit state change from the client.
    pub async fn handle_update(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        let user_id = require_user(ctx)?;
        let payload: crate::models::PresenceUpdatePayload = parse_payload(msg)?;
        store::presence::update(&self.pool, &user_id, &payload.state).await?;
        broadcast_presence(&self.registry, &user_id, &payload.state).await;
        Ok(Envelope::response_to(
            msg,
            &msg.command,
            json!({"status": Status::Success.as_u16()}),
        ))
    }

    /// `presence/list`: every currently online user, sorted ascending.
    /// Unscoped by friendship: clients also use this for discovery.
    pub async fn handle_list(
        &self,
        msg: &Envelope,
        ctx: &Arc<ConnectionContext>,
    ) -> ProtocolResult<Envelope> {
        require_user(ctx)?;
        let users = store::presence::list_online(&self.pool).await?;
        Ok(Envelope::response_to(
            msg,
            &msg.command,
            json!({"status": Status::Success.as_u16(), "users": users}),
        ))
    }
}

/// Periodically scans for idle connections, evicts them from the registry,
/// marks them offline, and broadcasts the change. Heartbeat frames keep
/// `last_seen` fresh through the per-frame touch in the server loop.
pub struct PresenceCleaner {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
    timeout: u64,
    interval: u64,
}

impl PresenceCleaner {
    pub fn new(pool: DbPool, registry: Arc<ConnectionRegistry>, timeout: u64, interval: u64) -> Self {
        Self {
            pool,
            registry,
            timeout,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                tracing::error!("Presence cleaner failed: {e}");
            }
        }
    }

    async fn sweep(&self) -> ProtocolResult<()> {
        let cutoff = unix_now() - self.timeout as i64;
        let removed = self.registry.cleanup_idle(cutoff);
        if removed.is_empty() {
            return Ok(());
        }
        tracing::info!("Cleaned up {} idle session(s)", removed.len());
        for (user_id, ctx) in removed {
            store::presence::update(&self.pool, &user_id, "offline").await?;
            broadcast_presence(&self.registry, &user_id, "offline").await;
            ctx.close().await;
        }
        Ok(())
    }
}
