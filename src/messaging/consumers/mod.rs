//! Built-in consumers and their message families

pub mod audit;
pub mod crm_sync;
pub mod notification;

pub use audit::{AuditEventConsumer, AuditEventMessage, AuditEventType, AuditStore, LoggingAuditStore};
pub use crm_sync::{Address, CrmClient, CrmSyncConsumer, CrmSyncMessage, CrmSyncType, LoggingCrmClient};
pub use notification::{
    EmailNotificationConsumer, EmailSender, LoggingEmailSender, NotificationMessage,
    NotificationType,
};

use crate::logging::{LogEntry, LogSink};
use crate::messaging::consumer::{default_disposition, ConsumerMetrics};
use crate::messaging::envelope::{ConsumerMessage, ConsumerResult};
use crate::messaging::error::MessagingError;
use crate::messaging::validation::{FieldViolation, ValidationFailure, ValidationPipe};
use serde::Serialize;
use serde_json::Value;

/// Any inbound payload, routed to its family by the `type` field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Notification(NotificationMessage),
    Audit(AuditEventMessage),
    CrmSync(CrmSyncMessage),
}

impl InboundMessage {
    /// Validate a raw payload into whichever family its `type` belongs to
    pub fn parse(pipe: &ValidationPipe, raw: &Value) -> Result<Self, ValidationFailure> {
        let payload = ValidationPipe::unwrap_envelope(raw);
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();

        if notification::NOTIFICATION_TYPES.contains(&kind) {
            pipe.transform(payload).map(InboundMessage::Notification)
        } else if audit::AUDIT_EVENT_TYPES.contains(&kind) {
            pipe.transform(payload).map(InboundMessage::Audit)
        } else if crm_sync::CRM_SYNC_TYPES.contains(&kind) {
            pipe.transform(payload).map(InboundMessage::CrmSync)
        } else {
            let known: Vec<&str> = notification::NOTIFICATION_TYPES
                .iter()
                .chain(audit::AUDIT_EVENT_TYPES)
                .chain(crm_sync::CRM_SYNC_TYPES)
                .copied()
                .collect();
            Err(ValidationFailure::new(vec![FieldViolation::new(
                "type",
                payload.get("type"),
            )
            .with_constraint(
                "isIn",
                format!("type must be one of the following values: {}", known.join(", ")),
            )]))
        }
    }

    /// Family name of the parsed message
    pub fn family(&self) -> &'static str {
        use crate::messaging::validation::MessageContract;

        match self {
            InboundMessage::Notification(_) => NotificationMessage::FAMILY,
            InboundMessage::Audit(_) => AuditEventMessage::FAMILY,
            InboundMessage::CrmSync(_) => CrmSyncMessage::FAMILY,
        }
    }
}

/// Shared `handle_error` body: count, log, then retry transient errors and dead-letter the rest
pub(crate) fn handle_failure<T>(
    metrics: &ConsumerMetrics,
    log: &dyn LogSink,
    context: &str,
    error: &MessagingError,
    message: &ConsumerMessage<T>,
) -> ConsumerResult {
    metrics.record_failed();
    let disposition = default_disposition(error);
    if disposition.retry {
        metrics.record_retried();
    }

    log.error(
        LogEntry::new(format!(
            "Handling error for message: {}",
            message.correlation_id().unwrap_or("-")
        ))
        .context(context)
        .correlation_id(message.correlation_id())
        .param("messageId", message.message_id())
        .param("attempt", message.attempt)
        .param("error", error.to_string())
        .param("retry", disposition.retry),
    );
    disposition
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routes_by_type() {
        let pipe = ValidationPipe::new();

        let parsed = InboundMessage::parse(
            &pipe,
            &json!({"type": "user-welcome", "userId": "1", "email": "a@example.com"}),
        )
        .unwrap();
        assert_eq!(parsed.family(), "notification");

        let parsed = InboundMessage::parse(
            &pipe,
            &json!({"body": {"type": "security-event", "userId": "1", "action": "login"}}),
        )
        .unwrap();
        assert!(matches!(parsed, InboundMessage::Audit(_)));

        let parsed =
            InboundMessage::parse(&pipe, &json!({"type": "crm-user-delete", "userId": "1"}))
                .unwrap();
        assert_eq!(parsed.family(), "crm-sync");
    }

    #[test]
    fn test_unknown_type_is_rejected_on_type_field() {
        let failure =
            InboundMessage::parse(&ValidationPipe::new(), &json!({"type": "invalid-type"}))
                .unwrap_err();
        let violation = failure.violation("type").unwrap();
        assert!(violation.constraints.contains_key("isIn"));
        assert_eq!(violation.value, Some(json!("invalid-type")));
    }
}
