//! Consumer-side deduplication on message id

use moka::future::Cache;
use std::time::Duration;

/// Remembers claimed message ids for a bounded window
#[derive(Clone)]
pub struct Deduplicator {
    seen: Cache<String, ()>,
}

impl Deduplicator {
    pub fn new(window: Duration, capacity: u64) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(window)
                .build(),
        }
    }

    /// Claim `message_id` for processing.
    ///
    /// Returns `false` when another delivery already holds the id within the
    /// window. The check and the insert are one atomic step, so concurrent
    /// deliveries of the same id see exactly one winner.
    pub async fn claim(&self, message_id: &str) -> bool {
        self.seen
            .entry(message_id.to_string())
            .or_insert(())
            .await
            .is_fresh()
    }

    /// Release a claim so a redelivery is processed again
    pub async fn forget(&self, message_id: &str) {
        self.seen.invalidate(message_id).await;
    }
}
