//! Unread-count aggregation forwarded to the host badge sink.

use std::sync::Arc;
use tracing::warn;

use crate::engine::{BadgeSink, ProtocolEngine};

/// Recomputes the total unread count after any mutation that can change
/// per-channel message or read counts.
pub struct BadgeAggregator {
    engine: Arc<dyn ProtocolEngine>,
    sink: Arc<dyn BadgeSink>,
}

impl BadgeAggregator {
    pub fn new(engine: Arc<dyn ProtocolEngine>, sink: Arc<dyn BadgeSink>) -> Arc<Self> {
        Arc::new(Self { engine, sink })
    }

    /// Sum of `max(message_count - read_count, 0)` over all channels, pushed
    /// to the sink. Engine read failures are logged, not propagated.
    pub async fn recompute(&self) {
        match self.unread_total().await {
            Ok(total) => self.sink.set_badge_count(total).await,
            Err(err) => warn!(error = %err, "badge: failed to recompute unread count"),
        }
    }

    async fn unread_total(&self) -> anyhow::Result<u64> {
        let mut total = 0u64;
        for channel in self.engine.channels().await {
            let count = channel.message_count().await?;
            let read = channel.metadata().await.read_count;
            total += count.saturating_sub(read);
        }
        Ok(total)
    }
}
