use crate::error::{AppError, Result};
use crate::messaging::{BrokerConfig, ConsumerConfig, ProducerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming an optional override file
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG_PATH";

/// Prefix of `RELAY__SECTION__KEY` environment overrides
pub const ENV_PREFIX: &str = "RELAY";

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumers: ConsumerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Config {
    /// Load configuration from the embedded defaults, the file named by
    /// `RELAY_CONFIG_PATH` and `RELAY__*` environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::build(path.as_deref())
    }

    /// Load with an explicit override file instead of `RELAY_CONFIG_PATH`
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        Self::build(Some(&path))
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Configuration(
                "server.port must be greater than 0".to_string(),
            ));
        }
        self.broker.validate()?;
        self.producer.validate()?;
        self.consumers.validate()?;
        Ok(())
    }

    /// Address the ops HTTP surface binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
            },
            broker: BrokerConfig::default(),
            producer: ProducerConfig::default(),
            consumers: ConsumerConfig::default(),
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logs: false,
                prometheus_enabled: true,
            },
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{BrokerBackend, QoSLevel};
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_default_values() {
        assert_eq!(default_host(), "0.0.0.0");
        assert_eq!(default_port(), 8080);
        assert_eq!(default_log_level(), "info");
        assert!(default_true());
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let config = Config::load_from("/nonexistent/relay.toml").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.broker.backend, BrokerBackend::InMemory);
        assert_eq!(config.producer.default_qos, QoSLevel::AtLeastOnce);
        assert_eq!(config.producer.confirm_timeout, Duration::from_secs(5));
        assert_eq!(config.consumers.max_retries, 3);
        assert!(config.consumers.crm_sync_enabled);
        assert!(config.observability.prometheus_enabled);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9191

[broker]
backend = "nats"

[broker.nats]
servers = ["nats://broker:4222"]

[producer]
default_qos = "exactly-once"
batch_size = 10

[consumers]
max_retries = 5
audit_enabled = false
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server.port, 9191);
        assert_eq!(config.broker.backend, BrokerBackend::Nats);
        assert_eq!(config.broker.nats.servers, vec!["nats://broker:4222"]);
        assert_eq!(config.producer.default_qos, QoSLevel::ExactlyOnce);
        assert_eq!(config.producer.batch_size, 10);
        assert_eq!(config.consumers.max_retries, 5);
        assert!(!config.consumers.audit_enabled);
        // untouched keys keep the embedded defaults
        assert_eq!(config.producer.default_exchange, "default");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[producer]\nbatch_size = 0").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn test_bind_address() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }
}
