mod common;

use common::{metric_value, producer_with, welcome};
use reliable_messaging::messaging::{
    init_messaging_metrics, render_metrics, MessageProducer, ProducerConfig, SendOptions,
};

#[tokio::test]
async fn test_published_messages_are_exported() {
    init_messaging_metrics();
    let (producer, _, _) = producer_with(ProducerConfig::default()).await;

    let before = metric_value(
        &render_metrics(),
        "messaging_messages_published_total",
        &[("exchange", "notifications"), ("transport", "in-memory")],
    );

    for i in 0..3 {
        let result = producer
            .send(
                "email.notifications",
                welcome(&format!("u{}", i)),
                SendOptions::new().exchange("notifications"),
            )
            .await;
        assert!(result.success);
    }

    let output = render_metrics();
    let after = metric_value(
        &output,
        "messaging_messages_published_total",
        &[("exchange", "notifications"), ("transport", "in-memory")],
    );
    // other tests in this binary may publish concurrently
    assert!(after - before >= 3.0, "before={} after={}", before, after);
    assert!(output.contains("# TYPE messaging_publish_latency_seconds histogram"));
}

#[tokio::test]
async fn test_disabled_metrics_are_not_recorded() {
    init_messaging_metrics();
    let config = ProducerConfig::builder()
        .default_exchange("audit")
        .enable_metrics(false)
        .build()
        .unwrap();
    let (producer, _, _) = producer_with(config).await;

    let labels = [("exchange", "audit"), ("transport", "in-memory")];
    let before = metric_value(&render_metrics(), "messaging_messages_published_total", &labels);

    let result = producer
        .send(
            "audit.events",
            reliable_messaging::messaging::BaseMessage::new(serde_json::json!({
                "type": "security-event",
                "userId": "u1",
                "action": "login"
            })),
            SendOptions::new(),
        )
        .await;
    assert!(result.success);

    let after = metric_value(&render_metrics(), "messaging_messages_published_total", &labels);
    assert_eq!(before, after);
}
