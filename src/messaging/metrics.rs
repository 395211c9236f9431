//! Prometheus metrics for messaging

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

/// Messaging metrics
pub struct MessagingMetrics {
    /// Messages published counter
    pub messages_published: CounterVec,

    /// Message publish failures
    pub publish_failures: CounterVec,

    /// Publish attempts repeated after a transient failure
    pub publish_retries: CounterVec,

    /// Messages handled successfully by a consumer
    pub messages_consumed: CounterVec,

    /// Handler failures
    pub consume_failures: CounterVec,

    /// Messages requeued for another attempt
    pub messages_retried: CounterVec,

    /// Messages routed to a dead-letter destination
    pub messages_dead_lettered: CounterVec,

    /// Messages rejected before reaching a handler
    pub messages_rejected: CounterVec,

    /// Deliveries skipped because the message id was already processed
    pub duplicates_skipped: CounterVec,

    /// Connected transports
    pub active_connections: GaugeVec,

    /// Message publish latency
    pub publish_latency: HistogramVec,

    /// Handler processing time
    pub processing_duration: HistogramVec,
}

lazy_static! {
    pub static ref MESSAGING_METRICS: MessagingMetrics = MessagingMetrics {
        messages_published: register_counter_vec!(
            "messaging_messages_published_total",
            "Total number of messages published",
            &["exchange", "transport"]
        )
        .expect("Failed to create messaging_messages_published_total"),

        publish_failures: register_counter_vec!(
            "messaging_publish_failures_total",
            "Total number of publish failures",
            &["exchange", "transport", "error"]
        )
        .expect("Failed to create messaging_publish_failures_total"),

        publish_retries: register_counter_vec!(
            "messaging_publish_retries_total",
            "Total number of repeated publish attempts",
            &["exchange", "transport"]
        )
        .expect("Failed to create messaging_publish_retries_total"),

        messages_consumed: register_counter_vec!(
            "messaging_messages_consumed_total",
            "Total number of messages processed successfully",
            &["queue", "consumer"]
        )
        .expect("Failed to create messaging_messages_consumed_total"),

        consume_failures: register_counter_vec!(
            "messaging_consume_failures_total",
            "Total number of handler failures",
            &["queue", "consumer", "error"]
        )
        .expect("Failed to create messaging_consume_failures_total"),

        messages_retried: register_counter_vec!(
            "messaging_messages_retried_total",
            "Total number of messages requeued for retry",
            &["queue", "consumer"]
        )
        .expect("Failed to create messaging_messages_retried_total"),

        messages_dead_lettered: register_counter_vec!(
            "messaging_messages_dead_lettered_total",
            "Total number of messages sent to a dead-letter destination",
            &["queue", "reason"]
        )
        .expect("Failed to create messaging_messages_dead_lettered_total"),

        messages_rejected: register_counter_vec!(
            "messaging_messages_rejected_total",
            "Total number of messages rejected before processing",
            &["queue", "reason"]
        )
        .expect("Failed to create messaging_messages_rejected_total"),

        duplicates_skipped: register_counter_vec!(
            "messaging_duplicates_skipped_total",
            "Total number of duplicate deliveries acknowledged without processing",
            &["queue"]
        )
        .expect("Failed to create messaging_duplicates_skipped_total"),

        active_connections: register_gauge_vec!(
            "messaging_active_connections",
            "Number of active messaging connections",
            &["transport"]
        )
        .expect("Failed to create messaging_active_connections"),

        publish_latency: register_histogram_vec!(
            "messaging_publish_latency_seconds",
            "Message publish latency in seconds",
            &["exchange", "transport"]
        )
        .expect("Failed to create messaging_publish_latency_seconds"),

        processing_duration: register_histogram_vec!(
            "messaging_processing_duration_seconds",
            "Consumer handler duration in seconds",
            &["queue", "consumer"]
        )
        .expect("Failed to create messaging_processing_duration_seconds"),
    };
}

/// Initialize messaging metrics
pub fn init_messaging_metrics() {
    lazy_static::initialize(&MESSAGING_METRICS);
}

/// Render every registered metric in the Prometheus text format
pub fn render_metrics() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        init_messaging_metrics();
        MESSAGING_METRICS
            .messages_published
            .with_label_values(&["metrics-test", "in-memory"])
            .inc();

        let text = render_metrics();
        assert!(text.contains("messaging_messages_published_total"));
        assert!(text.contains("metrics-test"));
    }
}
