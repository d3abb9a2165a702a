use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Handle;

/// Builder for [`SyncTelemetry`].
pub struct SyncTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl SyncTelemetryBuilder {
    /// Starts a builder for the named component.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Writes JSON log lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops JSON records below `level`. Tracing output is unaffected.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Publishes events to `publisher`.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Opens the log file (if any) and builds the handle.
    pub fn build(self) -> Result<SyncTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(
                JsonLogger::new(path)?.with_min_level(self.min_level),
            )),
            None => None,
        };
        Ok(SyncTelemetry {
            inner: Arc::new(TelemetryInner {
                component: self.component,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Logging and event hook shared by the core components.
///
/// Every record goes to `tracing`; JSON lines and bus events are written only when a
/// log path or publisher was configured.
#[derive(Clone)]
pub struct SyncTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    component: String,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for SyncTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTelemetry")
            .field("component", &self.inner.component)
            .field("json", &self.inner.logger.is_some())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

impl SyncTelemetry {
    /// Starts a builder.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> SyncTelemetryBuilder {
        SyncTelemetryBuilder::new(component)
    }

    /// Tracing-only telemetry.
    #[must_use]
    pub fn disabled(component: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                component: component.into(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Same sinks under another component name.
    #[must_use]
    pub fn scoped(&self, component: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                component: component.into(),
                logger: self.inner.logger.clone(),
                publisher: self.inner.publisher.clone(),
            }),
        }
    }

    /// Component name.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.inner.component
    }

    /// Records a structured log entry. JSON write failures are reported through tracing
    /// and never propagate to the caller.
    pub fn log(&self, level: LogLevel, message: &str, fields: Value) {
        let component = self.inner.component.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(component, %fields, "{message}"),
            LogLevel::Info => tracing::info!(component, %fields, "{message}"),
            LogLevel::Warn => tracing::warn!(component, %fields, "{message}"),
            LogLevel::Error => tracing::error!(component, %fields, "{message}"),
        }
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(component, level, message);
            if let Value::Object(map) = fields {
                record.fields = map;
            }
            if let Err(err) = logger.log(&record) {
                tracing::warn!(component, "json log write failed: {err:#}");
            }
        }
    }

    /// Publishes an event without waiting for the sink. Requires a tokio runtime; outside
    /// one the event is dropped.
    pub fn event(&self, event_type: &str, payload: Value) {
        let Some(publisher) = &self.inner.publisher else {
            return;
        };
        let record = EventRecord::new(self.inner.component.clone(), event_type, payload);
        match Handle::try_current() {
            Ok(handle) => {
                let publisher = Arc::clone(publisher);
                handle.spawn(async move {
                    if let Err(err) = publisher.publish(record).await {
                        tracing::warn!("telemetry event publish failed: {err:#}");
                    }
                });
            }
            Err(_) => tracing::debug!(event_type, "no runtime, telemetry event dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_log_line_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sync.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = SyncTelemetry::builder("interlock")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry.log(LogLevel::Info, "valve.actuated", json!({ "closed": true }));
        telemetry.event("skid.valve.actuated", json!({ "closed": true }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("valve.actuated"));
        assert!(content.contains("\"component\":\"interlock\""));
        assert_eq!(bus.recent_of("skid.valve.actuated").len(), 1);
    }

    #[tokio::test]
    async fn scoped_handle_shares_sinks() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sync.log");
        let telemetry = SyncTelemetry::builder("skid").log_path(&path).build().unwrap();
        telemetry
            .scoped("broadcaster")
            .log(LogLevel::Warn, "subscriber.dropped", json!({ "id": 3 }));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"component\":\"broadcaster\""));
    }

    #[test]
    fn disabled_telemetry_is_silent() {
        let telemetry = SyncTelemetry::disabled("driver");
        telemetry.log(LogLevel::Error, "tick.failed", json!({}));
        telemetry.event("skid.tick.completed", json!({}));
        assert_eq!(telemetry.component(), "driver");
    }
}
