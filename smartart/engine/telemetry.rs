use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use shared_message_bus::{BusMessage, BusPublisher};

/// Topic prefix under which telemetry events are published.
pub const EVENT_TOPIC_PREFIX: &str = "smartart/events";

/// Builder for engine telemetry sinks.
pub struct EngineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    sinks: Vec<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn BusPublisher>>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            sinks: Vec::new(),
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Adds an extra log sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Sets the bus publisher used for events.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn BusPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<EngineTelemetry> {
        let mut sinks = self.sinks;
        if let Some(path) = self.log_path {
            sinks.push(Arc::new(JsonLogger::new(path)?));
        }
        Ok(EngineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sinks,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared across engine components.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("module", &self.inner.module)
            .field("sinks", &self.inner.sinks.len())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sinks: Vec<Arc<dyn LogSink>>,
    publisher: Option<Arc<dyn BusPublisher>>,
}

impl EngineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(module)
    }

    /// Telemetry that only forwards to `tracing`.
    #[must_use]
    pub fn disabled(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                sinks: Vec::new(),
                publisher: None,
            }),
        }
    }

    /// Module name stamped on every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs structured metadata to every sink and mirrors it to `tracing`.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let module = self.inner.module.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(module, %metadata, "{message}"),
            LogLevel::Info => tracing::info!(module, %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(module, %metadata, "{message}"),
            LogLevel::Error => tracing::error!(module, %metadata, "{message}"),
        }
        if self.inner.sinks.is_empty() {
            return Ok(());
        }
        let record = LogRecord::new(module, level, message).with_metadata(&metadata);
        for sink in &self.inner.sinks {
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Publishes an event under `smartart/events/<event_type>`.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            let body = serde_json::json!({
                "source": self.inner.module,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "payload": payload,
            });
            publisher.publish(BusMessage::json(
                format!("{EVENT_TOPIC_PREFIX}/{event_type}"),
                &body,
            )?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_logging::MemoryLogSink;
    use shared_message_bus::MemoryBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("display.log.jsonl");
        let bus = Arc::new(MemoryBus::new(16));
        let memory = Arc::new(MemoryLogSink::new(8));
        let telemetry = EngineTelemetry::builder("display")
            .log_path(&path)
            .sink(memory.clone())
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "policy.cycle", json!({ "epsilon": 0.5 }))
            .unwrap();
        telemetry
            .event("policy.cycle", json!({ "changed": true }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("policy.cycle"));
        assert_eq!(memory.count("policy.cycle"), 1);
        let events = bus.snapshot_matching("smartart/events/#");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "smartart/events/policy.cycle");
    }

    #[test]
    fn disabled_telemetry_is_silent() {
        let telemetry = EngineTelemetry::disabled("test");
        assert!(telemetry.log(LogLevel::Warn, "x", Value::Null).is_ok());
        assert!(telemetry.event("x", Value::Null).is_ok());
        assert_eq!(telemetry.module(), "test");
    }
}
