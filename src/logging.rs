//! Structured log sink
//!
//! Messaging components report outcomes as [`LogEntry`] values through a
//! [`LogSink`]. The production sink renders entries through `tracing` after
//! masking sensitive fields; [`MemoryLogSink`] captures them for assertions.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use strum::Display;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Replacement for fully masked values
pub const MASK: &str = "***";

/// Keys whose values are never logged
const MASKED_FIELDS: &[&str] = &[
    "password",
    "oldPassword",
    "newPassword",
    "accessToken",
    "refreshToken",
    "authorization",
    "authToken",
    "secret",
];

/// Keys whose values are partially masked
const PARTIAL_FIELDS: &[&str] = &["phoneNumber"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub message: String,
    /// Emitting component
    pub context: Option<String>,
    pub correlation_id: Option<String>,
    pub params: Map<String, Value>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            correlation_id: None,
            params: Map::new(),
        }
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: Option<impl Into<String>>) -> Self {
        self.correlation_id = correlation_id.map(Into::into);
        self
    }

    /// Attach a parameter; values that fail to serialize are recorded as null
    pub fn param(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.params.insert(
            key.into(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
        self
    }
}

/// Destination for structured log entries
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, entry: LogEntry);

    fn debug(&self, entry: LogEntry) {
        self.log(LogLevel::Debug, entry);
    }

    fn info(&self, entry: LogEntry) {
        self.log(LogLevel::Info, entry);
    }

    fn warn(&self, entry: LogEntry) {
        self.log(LogLevel::Warn, entry);
    }

    fn error(&self, entry: LogEntry) {
        self.log(LogLevel::Error, entry);
    }
}

/// Mask sensitive values anywhere in a JSON tree
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let redacted = if MASKED_FIELDS.contains(&key.as_str()) {
                        Value::String(MASK.to_string())
                    } else if PARTIAL_FIELDS.contains(&key.as_str()) {
                        Value::String(mask_partial(value))
                    } else {
                        redact(value)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Keep the first three and last two characters, mask the rest
fn mask_partial(value: &Value) -> String {
    let raw = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 5 {
        return raw;
    }
    let middle = chars.len() - 5;
    let mut masked: String = chars[..3].iter().collect();
    masked.push_str(&"*".repeat(middle));
    masked.extend(&chars[chars.len() - 2..]);
    masked
}

/// Sink that forwards entries to `tracing` after redaction
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl TracingLogSink {
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, entry: LogEntry) {
        let params = redact(&Value::Object(entry.params));
        let context = entry.context.as_deref().unwrap_or("-");
        let correlation_id = entry.correlation_id.as_deref().unwrap_or("-");

        match level {
            LogLevel::Debug => tracing::debug!(
                context = context,
                correlation_id = correlation_id,
                params = %params,
                "{}",
                entry.message
            ),
            LogLevel::Info => tracing::info!(
                context = context,
                correlation_id = correlation_id,
                params = %params,
                "{}",
                entry.message
            ),
            LogLevel::Warn => tracing::warn!(
                context = context,
                correlation_id = correlation_id,
                params = %params,
                "{}",
                entry.message
            ),
            LogLevel::Error => tracing::error!(
                context = context,
                correlation_id = correlation_id,
                params = %params,
                "{}",
                entry.message
            ),
        }
    }
}

/// Sink that keeps every entry in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    entries: Arc<Mutex<Vec<(LogLevel, LogEntry)>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogLevel, LogEntry)> {
        self.entries.lock().clone()
    }

    /// Entries whose message contains `needle`
    pub fn find(&self, needle: &str) -> Vec<(LogLevel, LogEntry)> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.message.contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, entry: LogEntry) {
        self.entries.lock().push((level, entry));
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_level`; `json` switches to JSON lines.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "reliable_messaging={level},relayd={level},tower_http=info",
            level = default_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        eprintln!("Tracing subscriber already installed: {}", e);
    }
}
