//! Shared fixtures for integration tests

#![allow(dead_code)]

use reliable_messaging::logging::MemoryLogSink;
use reliable_messaging::messaging::{
    BaseMessage, BrokerProducer, InMemoryTransport, ProducerConfig, Transport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Connected in-memory broker with the default topology
pub async fn connected_transport() -> InMemoryTransport {
    let transport = InMemoryTransport::with_default_topology().unwrap();
    transport.connect().await.unwrap();
    transport
}

/// Producer over a fresh in-memory broker, with its captured log
pub async fn producer_with(config: ProducerConfig) -> (BrokerProducer, InMemoryTransport, MemoryLogSink) {
    let transport = connected_transport().await;
    let log = MemoryLogSink::new();
    let producer =
        BrokerProducer::new(Arc::new(transport.clone()), config, Arc::new(log.clone())).unwrap();
    (producer, transport, log)
}

pub fn welcome(user_id: &str) -> BaseMessage<Value> {
    BaseMessage::new(json!({
        "type": "user-welcome",
        "userId": user_id,
        "email": format!("{}@example.com", user_id),
        "name": "Ana"
    }))
}

/// Parse Prometheus text output into `metric{labels}` -> value
pub fn parse_prometheus_output(output: &str) -> HashMap<String, f64> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            Some((series.to_string(), value.parse().ok()?))
        })
        .collect()
}

/// Sum of every series of `metric` whose labels contain all `labels`
pub fn metric_value(output: &str, metric: &str, labels: &[(&str, &str)]) -> f64 {
    parse_prometheus_output(output)
        .into_iter()
        .filter(|(series, _)| {
            series.starts_with(&format!("{}{{", metric))
                && labels
                    .iter()
                    .all(|(k, v)| series.contains(&format!("{}=\"{}\"", k, v)))
        })
        .map(|(_, value)| value)
        .sum()
}
