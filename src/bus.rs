use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::queue::WorkQueue;
use crate::store::Store;

const FLUSH_BATCH: i64 = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Moves committed pending events onto the queue as `event` messages.
/// Nudged by the store after commits; the periodic tick catches rows a
/// crashed process left behind. Safe to run in every process.
pub struct OutboxFlusher {
    store: Store,
    queue: Arc<dyn WorkQueue>,
}

impl OutboxFlusher {
    pub fn new(store: Store, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    pub fn start(self, cancel: CancellationToken) {
        let nudge = self.store.outbox_nudge();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = nudge.notified() => {}
                }
                if let Err(err) = self.drain().await {
                    tracing::warn!(error = %err, "outbox flush failed");
                }
            }
        });
    }

    async fn drain(&self) -> anyhow::Result<()> {
        loop {
            let published = self
                .store
                .flush_pending_events(self.queue.as_ref(), FLUSH_BATCH)
                .await?;
            if published < FLUSH_BATCH as usize {
                return Ok(());
            }
        }
    }
}
