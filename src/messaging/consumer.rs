//! Consumer contract
//!
//! A consumer owns one queue and one message family. The dispatcher validates
//! each delivery into `Self::Message`, calls [`MessageConsumer::process`] and,
//! when that fails, asks [`MessageConsumer::handle_error`] whether the message
//! should be retried or dead-lettered.

use crate::messaging::config::duration_ms;
use crate::messaging::envelope::{ConsumerMessage, ConsumerResult};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::validation::MessageContract;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Queue consumer for a single message family
#[async_trait]
pub trait MessageConsumer: Send + Sync + 'static {
    /// Payload family this consumer accepts
    type Message: MessageContract;

    /// Unique consumer identifier
    fn id(&self) -> &str;

    /// Queue this consumer reads from
    fn queue_name(&self) -> &str;

    /// Handle one validated message
    async fn process(
        &self,
        message: &ConsumerMessage<Self::Message>,
    ) -> MessagingResult<ConsumerResult>;

    /// Decide what happens to a message whose processing failed
    async fn handle_error(
        &self,
        error: &MessagingError,
        message: &ConsumerMessage<Self::Message>,
    ) -> ConsumerResult;

    async fn is_healthy(&self) -> bool {
        true
    }

    fn metrics(&self) -> ConsumerMetricsSnapshot;
}

/// Retry transient failures, dead-letter everything else
pub fn default_disposition(error: &MessagingError) -> ConsumerResult {
    if error.is_transient() {
        ConsumerResult::retry(error.clone(), None)
    } else {
        ConsumerResult::dead_letter(error.clone())
    }
}

/// Per-consumer counters
#[derive(Debug)]
pub struct ConsumerMetrics {
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    total_retried: AtomicU64,
    processing_micros: AtomicU64,
    started_at: Instant,
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_retried: AtomicU64::new(0),
            processing_micros: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Count a message handled successfully
    pub fn record_processed(&self, elapsed: Duration) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Count a failed processing attempt
    pub fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.total_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        let processed = self.total_processed.load(Ordering::Relaxed);
        let average_processing_time = if processed == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.processing_micros.load(Ordering::Relaxed) / processed)
        };

        ConsumerMetricsSnapshot {
            total_processed: processed,
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            average_processing_time,
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Point-in-time copy of consumer counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerMetricsSnapshot {
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    #[serde(rename = "average_processing_time_ms", with = "duration_ms")]
    pub average_processing_time: Duration,
    #[serde(rename = "uptime_ms", with = "duration_ms")]
    pub uptime: Duration,
}
