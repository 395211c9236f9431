//! Email notifications

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

pub const NOTIFICATION_TYPES: &[&str] = &["user-welcome", "password-reset", "system-alert"];

const SHAPE: &[FieldSpec] = &[
    FieldSpec::required("type", FieldKind::Enum(NOTIFICATION_TYPES)),
    FieldSpec::required("userId", FieldKind::String),
    FieldSpec::required("email", FieldKind::String),
    FieldSpec::optional("name", FieldKind::String),
    FieldSpec::optional("template", FieldKind::String),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NotificationType {
    UserWelcome,
    PasswordReset,
    SystemAlert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    #[serde(rename = "type")]
    pub kind: NotificationType,

    #[validate(length(min = 1))]
    pub user_id: String,

    #[validate(email)]
    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl MessageContract for NotificationMessage {
    const FAMILY: &'static str = "notification";

    fn shape() -> &'static [FieldSpec] {
        SHAPE
    }
}

/// Delivers emails on behalf of the consumer
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, notification: &NotificationMessage) -> MessagingResult<()>;

    async fn is_available(&self) -> bool {
        true
    }
}

/// Sender that only records what it would have sent
pub struct LoggingEmailSender {
    log: Arc<dyn LogSink>,
}

impl LoggingEmailSender {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, notification: &NotificationMessage) -> MessagingResult<()> {
        let message = match notification.kind {
            NotificationType::UserWelcome => format!(
                "Sending welcome email to {} for user {}",
                notification.email, notification.user_id
            ),
            NotificationType::PasswordReset => format!(
                "Sending password reset email to {} for user {}",
                notification.email, notification.user_id
            ),
            NotificationType::SystemAlert => format!(
                "Sending system alert to {} for user {}",
                notification.email, notification.user_id
            ),
        };
        self.log.info(
            LogEntry::new(message)
                .context("LoggingEmailSender.send")
                .param("template", &notification.template),
        );
        Ok(())
    }
}

/// Consumes `email.notifications`
pub struct EmailNotificationConsumer {
    sender: Arc<dyn EmailSender>,
    log: Arc<dyn LogSink>,
    metrics: ConsumerMetrics,
}

impl EmailNotificationConsumer {
    pub const ID: &'static str = "email-notification-consumer";
    pub const QUEUE: &'static str = "email.notifications";

    pub fn new(sender: Arc<dyn EmailSender>, log: Arc<dyn LogSink>) -> Self {
        Self {
            sender,
            log,
            metrics: ConsumerMetrics::new(),
        }
    }
}

#[async_trait]
impl MessageConsumer for EmailNotificationConsumer {
    type Message = NotificationMessage;

    fn id(&self) -> &str {
        Self::ID
    }

    fn queue_name(&self) -> &str {
        Self::QUEUE
    }

    async fn process(
        &self,
        message: &ConsumerMessage<NotificationMessage>,
    ) -> MessagingResult<ConsumerResult> {
        let started = Instant::now();
        self.log.info(
            LogEntry::new("Processing email notification")
                .context("EmailNotificationConsumer.process")
                .correlation_id(message.correlation_id())
                .param("body", &message.body),
        );

        self.sender.send(&message.body).await?;

        self.metrics.record_processed(started.elapsed());
        Ok(ConsumerResult::success())
    }

    async fn handle_error(
        &self,
        error: &MessagingError,
        message: &ConsumerMessage<NotificationMessage>,
    ) -> ConsumerResult {
        super::handle_failure(
            &self.metrics,
            self.log.as_ref(),
            "EmailNotificationConsumer.handle_error",
            error,
            message,
        )
    }

    async fn is_healthy(&self) -> bool {
        self.sender.is_available().await
    }

    fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.metrics.snapshot()
    }
}
