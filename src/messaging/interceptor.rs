//! Logging around consumer calls

use crate::logging::{LogEntry, LogSink};
use serde::Serialize;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Logs start, completion and failure of a wrapped call.
///
/// The wrapped result is returned untouched; errors are logged, never swallowed.
#[derive(Clone)]
pub struct LoggingInterceptor {
    log: Arc<dyn LogSink>,
}

impl LoggingInterceptor {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }

    pub async fn intercept<R, E, F>(&self, class: &str, method: &str, call: F) -> Result<R, E>
    where
        F: Future<Output = Result<R, E>>,
        R: Serialize,
        E: StdError,
    {
        let context = format!("{}.{}", class, method);
        self.log.info(
            LogEntry::new("Consumer method started")
                .context(context.as_str())
                .param("className", class)
                .param("methodName", method),
        );

        let started = Instant::now();
        let result = call.await;
        let duration = format!("{}ms", started.elapsed().as_millis());

        match &result {
            Ok(response) => self.log.info(
                LogEntry::new("Consumer method completed successfully")
                    .context(context.as_str())
                    .param("className", class)
                    .param("methodName", method)
                    .param("duration", &duration)
                    .param("response", response),
            ),
            Err(error) => self.log.error(
                LogEntry::new("Consumer method failed")
                    .context(context.as_str())
                    .param("className", class)
                    .param("methodName", method)
                    .param("duration", &duration)
                    .param("error", error.to_string())
                    .param("stack", source_chain(error)),
            ),
        }

        result
    }
}

/// Display strings of the error and each of its sources, outermost first
fn source_chain(error: &dyn StdError) -> Vec<String> {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogLevel, MemoryLogSink};
    use crate::messaging::error::MessagingError;

    #[tokio::test]
    async fn test_logs_success_with_response() {
        let sink = MemoryLogSink::new();
        let interceptor = LoggingInterceptor::new(Arc::new(sink.clone()));

        let result: Result<u32, MessagingError> = interceptor
            .intercept("EmailNotificationConsumer", "process", async { Ok(7) })
            .await;
        assert_eq!(result.unwrap(), 7);

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.message, "Consumer method started");
        let (level, done) = &entries[1];
        assert_eq!(*level, LogLevel::Info);
        assert_eq!(done.message, "Consumer method completed successfully");
        assert_eq!(done.params["response"], 7);
        assert!(done.params["duration"].as_str().unwrap().ends_with("ms"));
        assert_eq!(
            done.context.as_deref(),
            Some("EmailNotificationConsumer.process")
        );
    }

    #[tokio::test]
    async fn test_failure_is_logged_and_returned_unchanged() {
        let sink = MemoryLogSink::new();
        let interceptor = LoggingInterceptor::new(Arc::new(sink.clone()));

        let result: Result<(), MessagingError> = interceptor
            .intercept("AuditConsumer", "process", async {
                Err(MessagingError::transient("store offline"))
            })
            .await;
        assert!(matches!(
            result,
            Err(MessagingError::Handler { transient: true, .. })
        ));

        let failed = sink.find("failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, LogLevel::Error);
        assert_eq!(failed[0].1.params["error"], "Handler failed: store offline");
        assert_eq!(failed[0].1.params["stack"][0], "Handler failed: store offline");
    }
}
