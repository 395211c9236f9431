//! CRM synchronisation

use crate::logging::{LogEntry, LogSink};
use crate::messaging::consumer::{ConsumerMetrics, ConsumerMetricsSnapshot, MessageConsumer};
use crate::messaging::envelope::{ConsumerMessage, ConsumerResult};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::validation::{FieldKind, FieldSpec, MessageContract};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use strum::{Display, EnumString};
use validator::Validate;

pub const CRM_SYNC_TYPES: &[&str] = &["crm-user-sync", "crm-user-delete"];

const ADDRESS_SHAPE: &[FieldSpec] = &[
    FieldSpec::required("street", FieldKind::String),
    FieldSpec::required("city", FieldKind::String),
    FieldSpec::optional("state", FieldKind::String),
    FieldSpec::optional("postalCode", FieldKind::String),
    FieldSpec::required("country", FieldKind::String),
];

const SHAPE: &[FieldSpec] = &[
    FieldSpec::required("type", FieldKind::Enum(CRM_SYNC_TYPES)),
    FieldSpec::required("userId", FieldKind::String),
    FieldSpec::optional("email", FieldKind::String),
    FieldSpec::optional("name", FieldKind::String),
    FieldSpec::optional("phone", FieldKind::String),
    FieldSpec::optional("address", FieldKind::Object(ADDRESS_SHAPE)),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CrmSyncType {
    CrmUserSync,
    CrmUserDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[validate(length(min = 1))]
    pub street: String,
    #[validate(length(min = 1))]
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[validate(length(min = 1))]
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CrmSyncMessage {
    #[serde(rename = "type")]
    pub kind: CrmSyncType,

    #[validate(length(min = 1))]
    pub user_id: String,

    #[validate(email)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[validate(nested)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

impl MessageContract for CrmSyncMessage {
    const FAMILY: &'static str = "crm-sync";

    fn shape() -> &'static [FieldSpec] {
        SHAPE
    }
}

/// External CRM the consumer replicates users into
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn upsert_user(&self, user: &CrmSyncMessage) -> MessagingResult<()>;

    async fn delete_user(&self, user_id: &str) -> MessagingResult<()>;
}

/// Client that only logs the calls it would make
pub struct LoggingCrmClient {
    log: Arc<dyn LogSink>,
}

impl LoggingCrmClient {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl CrmClient for LoggingCrmClient {
    async fn upsert_user(&self, user: &CrmSyncMessage) -> MessagingResult<()> {
        self.log.info(
            LogEntry::new(format!(
                "Syncing user {} to CRM: {} - {}",
                user.user_id,
                user.name.as_deref().unwrap_or("-"),
                user.email.as_deref().unwrap_or("-")
            ))
            .context("LoggingCrmClient.upsert_user")
            .param("phoneNumber", &user.phone)
            .param("address", &user.address),
        );
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> MessagingResult<()> {
        self.log.info(
            LogEntry::new(format!("Removing user {} from CRM", user_id))
                .context("LoggingCrmClient.delete_user"),
        );
        Ok(())
    }
}

/// Consumes `crm.sync`
pub struct CrmSyncConsumer {
    client: Arc<dyn CrmClient>,
    log: Arc<dyn LogSink>,
    metrics: ConsumerMetrics,
}

impl CrmSyncConsumer {
    pub const ID: &'static str = "crm-sync-consumer";
    pub const QUEUE: &'static str = "crm.sync";

    pub fn new(client: Arc<dyn CrmClient>, log: Arc<dyn LogSink>) -> Self {
        Self {
            client,
            log,
            metrics: ConsumerMetrics::new(),
        }
    }
}

#[async_trait]
impl MessageConsumer for CrmSyncConsumer {
    type Message = CrmSyncMessage;

    fn id(&self) -> &str {
        Self::ID
    }

    fn queue_name(&self) -> &str {
        Self::QUEUE
    }

    async fn process(
        &self,
        message: &ConsumerMessage<CrmSyncMessage>,
    ) -> MessagingResult<ConsumerResult> {
        let started = Instant::now();
        self.log.info(
            LogEntry::new("Processing CRM sync")
                .context("CrmSyncConsumer.process")
                .correlation_id(message.correlation_id())
                .param("type", message.body.kind.to_string())
                .param("userId", &message.body.user_id),
        );

        match message.body.kind {
            CrmSyncType::CrmUserSync => self.client.upsert_user(&message.body).await?,
            CrmSyncType::CrmUserDelete => self.client.delete_user(&message.body.user_id).await?,
        }

        self.metrics.record_processed(started.elapsed());
        Ok(ConsumerResult::success())
    }

    async fn handle_error(
        &self,
        error: &MessagingError,
        message: &ConsumerMessage<CrmSyncMessage>,
    ) -> ConsumerResult {
        super::handle_failure(
            &self.metrics,
            self.log.as_ref(),
            "CrmSyncConsumer.handle_error",
            error,
            message,
        )
    }

    fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::validation::ValidationPipe;
    use serde_json::json;

    #[test]
    fn test_nested_address_violations_become_children() {
        let failure = ValidationPipe::new()
            .transform::<CrmSyncMessage>(&json!({
                "type": "crm-user-sync",
                "userId": "u1",
                "address": {"street": "Rua A", "zip": "000"}
            }))
            .unwrap_err();

        let address = failure.violation("address").unwrap();
        let children: Vec<&str> = address.children.iter().map(|c| c.field.as_str()).collect();
        assert!(children.contains(&"city"));
        assert!(children.contains(&"country"));
        assert!(children.contains(&"zip"));
    }

    #[test]
    fn test_full_payload_is_accepted() {
        let message: CrmSyncMessage = ValidationPipe::new()
            .transform(&json!({
                "type": "crm-user-sync",
                "userId": "u1",
                "email": "ana@example.com",
                "phone": "+5511999999999",
                "address": {"street": "Rua A", "city": "SP", "postalCode": "01000", "country": "BR"}
            }))
            .unwrap();
        assert_eq!(message.kind, CrmSyncType::CrmUserSync);
        assert_eq!(
            message.address.unwrap().postal_code.as_deref(),
            Some("01000")
        );
    }
}
