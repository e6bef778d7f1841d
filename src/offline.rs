use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::ProtocolResult;
use crate::registry::ConnectionRegistry;
use crate::store::{self, DbPool};

/// Capacity of the user-online wakeup channel.
pub const WAKEUP_CAPACITY: usize = 256;

pub fn wakeup_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(WAKEUP_CAPACITY)
}

/// Delivers queued events when users come back online. The store is the
/// source of truth; the channel is only a wakeup signal from the Auth
/// Service.
pub struct OfflineDispatcher {
    pool: DbPool,
    registry: Arc<ConnectionRegistry>,
    wakeups: mpsc::Receiver<String>,
}

impl OfflineDispatcher {
    pub fn new(
        pool: DbPool,
        registry: Arc<ConnectionRegistry>,
        wakeups: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            pool,
            registry,
            wakeups,
        }
    }

    pub async fn run(mut self) {
        while let Some(user_id) = self.wakeups.recv().await {
            if let Err(e) = self.drain(&user_id).await {
                tracing::error!("Offline dispatcher failed for {user_id}: {e}");
            }
        }
    }

    /// Drain the user's queue in insert order. If a live send fails, the
    /// failed event and everything behind it go back onto the queue in the
    /// same order.
    async fn drain(&self, user_id: &str) -> ProtocolResult<()> {
        let events = store::offline::consume(&self.pool, user_id).await?;
        if events.is_empty() {
            return Ok(());
        }
        tracing::debug!("Delivering {} offline event(s) to {user_id}", events.len());

        for (i, event) in events.iter().enumerate() {
            if !self.registry.send_to_user(user_id, event).await {
                // User went offline again; keep FIFO order for next login.
                for remaining in &events[i..] {
                    store::offline::enqueue(&self.pool, user_id, remaining).await?;
                }
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::envelope::Envelope;
    use crate::store::test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn failed_drain_requeues_everything_in_order() {
        let pool = test_pool().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (_tx, rx) = wakeup_channel();
        let dispatcher = OfflineDispatcher::new(pool.clone(), Arc::clone(&registry), rx);

        for i in 0..3 {
            let event = Envelope::event(Command::MessageEvent, json!({"seq": i}));
            store::offline::enqueue(&pool, "bob", &event).await.unwrap();
        }

        // Bob has no live connection: every event must survive the drain.
        dispatcher.drain("bob").await.unwrap();
        let requeued = store::offline::consume(&pool, "bob").await.unwrap();
        assert_eq!(requeued.len(), 3);
        for (i, event) in requeued.iter().enumerate() {
            assert_eq!(event.payload["seq"], i);
        }
    }
}
