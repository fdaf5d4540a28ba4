//! Structured logging setup for processes embedding the coordination core
//!
//! The core itself only emits `tracing` events; the host decides where they go.
//! `init_structured_logging` installs either a human-readable `fmt` layer or a
//! JSON layer that writes one `StructuredLogEntry` per line to stdout.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// One JSON log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
}

/// Process-level context attached to JSON entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub app_version: String,
    pub hostname: String,
    pub pid: u32,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
        }
    }
}

/// Layer that renders events as `StructuredLogEntry` JSON lines
pub struct JsonFormatter {
    context: Option<ExecutionContext>,
}

impl JsonFormatter {
    pub fn new(include_context: bool) -> Self {
        Self {
            context: include_context.then(ExecutionContext::default),
        }
    }

    fn render(&self, event: &Event<'_>) -> StructuredLogEntry {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level_name(event.metadata().level()).to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            context: self.context.clone(),
        }
    }
}

impl<S> Layer<S> for JsonFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let entry = self.render(event);
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(io::stdout(), "{}", json);
        }
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.insert(field, Value::String(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is not set
    pub level: Level,
    /// Emit JSON lines instead of human-readable output
    pub json_output: bool,
    /// ANSI colors (non-JSON only)
    pub color_output: bool,
    /// Attach hostname/pid to JSON entries
    pub include_context: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_context: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        Self {
            json_output: true,
            color_output: false,
            ..Self::default()
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.json_output {
        let subscriber = Registry::default()
            .with(env_filter)
            .with(JsonFormatter::new(config.include_context));
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output);
        let subscriber = Registry::default().with(env_filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Measures an operation and logs its duration when finished
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
    fields: HashMap<String, Value>,
}

impl OperationTimer {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Log the outcome and return the measured duration in milliseconds
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: &Result<T, E>) -> u64 {
        let duration_ms = self.elapsed_ms();
        match result {
            Ok(_) => tracing::debug!(
                operation = %self.operation_name,
                duration_ms = duration_ms,
                success = true,
                fields = ?self.fields,
                "Operation completed"
            ),
            Err(e) => tracing::warn!(
                operation = %self.operation_name,
                duration_ms = duration_ms,
                success = false,
                error = %e,
                fields = ?self.fields,
                "Operation failed"
            ),
        }
        duration_ms
    }
}
