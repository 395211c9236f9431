use anyhow::Context;
use reliable_messaging::{
    api::{build_router, AppState},
    config::Config,
    logging::{init_tracing, LogSink, TracingLogSink},
    messaging::{
        connect_with_retry, consumers, init_messaging_metrics, BrokerBackend, BrokerProducer,
        ConsumerConfig, ConsumerRegistry, Dispatcher, InMemoryTransport, MessageProducer,
        NatsTransport, Topology, Transport,
    },
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    init_tracing(
        &config.observability.log_level,
        config.observability.json_logs,
    );

    tracing::info!("Starting relayd v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Broker backend: {:?}", config.broker.backend);

    if config.observability.prometheus_enabled {
        init_messaging_metrics();
        tracing::info!("Prometheus metrics initialized");
    } else {
        tracing::info!("Prometheus metrics disabled in configuration");
    }

    let transport: Arc<dyn Transport> = match config.broker.backend {
        BrokerBackend::InMemory => Arc::new(InMemoryTransport::with_default_topology()?),
        BrokerBackend::Nats => Arc::new(NatsTransport::new(
            config.broker.nats.clone(),
            Topology::default_topology(),
        )?),
    };

    connect_with_retry(transport.as_ref(), &config.broker.connect_retry)
        .await
        .context("broker never became reachable")?;
    tracing::info!("Broker connected");

    let log: Arc<dyn LogSink> = Arc::new(TracingLogSink::new());

    let mut producer_config = config.producer.clone();
    let mut consumer_config = config.consumers.clone();
    if !config.observability.prometheus_enabled {
        producer_config.enable_metrics = false;
        consumer_config.enable_metrics = false;
    }

    let producer = BrokerProducer::new(transport.clone(), producer_config, log.clone())?;
    tracing::info!(producer_id = %producer.id(), "Producer initialized");

    let registry = build_registry(&consumer_config, log.clone());
    tracing::info!("Registered consumers: {:?}", registry.ids());

    let dispatcher = Dispatcher::new(
        transport.clone(),
        registry,
        consumer_config,
        log.clone(),
    )?;
    let consumers = dispatcher.start().await?;
    tracing::info!("Consumers started");

    let app = build_router(AppState::new(producer.clone()).with_dispatcher(dispatcher));

    let http_addr = config.bind_address();
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind {}", http_addr))?;

    tracing::info!("HTTP ops server listening on http://{}", http_addr);
    tracing::info!("   Health check: http://{}/health", http_addr);
    tracing::info!("   Metrics: http://{}/metrics", http_addr);

    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Shutting down gracefully...");
    consumers.shutdown().await;
    if let Err(e) = producer.close().await {
        tracing::warn!("Producer close failed: {}", e);
    }
    Ok(())
}

fn build_registry(config: &ConsumerConfig, log: Arc<dyn LogSink>) -> ConsumerRegistry {
    let mut registry = ConsumerRegistry::new();

    if config.notification_enabled {
        registry = registry.register(Arc::new(consumers::EmailNotificationConsumer::new(
            Arc::new(consumers::LoggingEmailSender::new(log.clone())),
            log.clone(),
        )));
    }
    if config.audit_enabled {
        registry = registry.register(Arc::new(consumers::AuditEventConsumer::new(
            Arc::new(consumers::LoggingAuditStore::new(log.clone())),
            log.clone(),
        )));
    }
    if config.crm_sync_enabled {
        registry = registry.register(Arc::new(consumers::CrmSyncConsumer::new(
            Arc::new(consumers::LoggingCrmClient::new(log.clone())),
            log,
        )));
    }

    registry
}
