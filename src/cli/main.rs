use clap::{Parser, Subcommand, ValueEnum};
use reliable_messaging::logging::TracingLogSink;
use reliable_messaging::messaging::consumers::{
    AuditEventMessage, CrmSyncMessage, InboundMessage, NotificationMessage,
};
use reliable_messaging::messaging::{
    BaseMessage, BrokerProducer, MessageProducer, NatsConfig, NatsTransport, ProducerConfig,
    QoSLevel, Topology, Transport, ValidationPipe,
};
use reqwest::Client;
use serde_json::{json, Value};
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Reliable messaging CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Notification,
    Audit,
    Crm,
}

#[derive(Clone, Copy, ValueEnum)]
enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<Qos> for QoSLevel {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoSLevel::AtMostOnce,
            Qos::AtLeastOnce => QoSLevel::AtLeastOnce,
            Qos::ExactlyOnce => QoSLevel::ExactlyOnce,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a JSON payload with the consumer-side pipe
    Validate {
        /// Message family; inferred from `type` when omitted
        #[arg(short, long, value_enum)]
        family: Option<Family>,

        #[arg(value_name = "JSON")]
        payload: String,
    },

    /// Publish a JSON payload through NATS
    Publish {
        #[arg(long, env = "RELAY_NATS_URL", default_value = "nats://localhost:4222")]
        nats: String,

        #[arg(short, long, default_value = "default")]
        exchange: String,

        #[arg(short, long)]
        routing_key: String,

        #[arg(short, long, value_enum, default_value = "at-least-once")]
        qos: Qos,

        #[arg(value_name = "JSON")]
        payload: String,
    },

    /// Check relayd health
    Health {
        #[arg(short, long, default_value = "http://localhost:8080")]
        endpoint: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { family, payload } => {
            let raw: Value = serde_json::from_str(&payload)?;
            let pipe = ValidationPipe::new();

            let outcome = match family {
                Some(Family::Notification) => pipe
                    .transform::<NotificationMessage>(&raw)
                    .map(InboundMessage::Notification),
                Some(Family::Audit) => pipe
                    .transform::<AuditEventMessage>(&raw)
                    .map(InboundMessage::Audit),
                Some(Family::Crm) => pipe
                    .transform::<CrmSyncMessage>(&raw)
                    .map(InboundMessage::CrmSync),
                None => InboundMessage::parse(&pipe, &raw),
            };

            match outcome {
                Ok(message) => {
                    println!("{}", serde_json::to_string_pretty(&message)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(failure) => {
                    eprintln!("{}", serde_json::to_string_pretty(&failure)?);
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Publish {
            nats,
            exchange,
            routing_key,
            qos,
            payload,
        } => {
            let body: Value = serde_json::from_str(&payload)?;
            let transport = NatsTransport::new(
                NatsConfig {
                    servers: vec![nats],
                    connection_name: "relay-cli".to_string(),
                    ..NatsConfig::default()
                },
                Topology::default_topology(),
            )?;
            transport.connect().await?;

            let producer = BrokerProducer::new(
                Arc::new(transport),
                ProducerConfig::builder().default_exchange(exchange).build()?,
                Arc::new(TracingLogSink::new()),
            )?;

            let result = producer
                .send_with_qos(&routing_key, BaseMessage::new(body), qos.into())
                .await;
            producer.close().await?;

            let summary = json!({
                "messageId": result.message_id,
                "success": result.success,
                "timestamp": result.timestamp,
                "deliveryTag": result.delivery_tag,
                "error": result.error.as_ref().map(|e| e.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Health { endpoint } => {
            let response = Client::new()
                .get(format!("{}/health", endpoint))
                .send()
                .await?;

            let healthy = response.status().is_success();
            let body: Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
