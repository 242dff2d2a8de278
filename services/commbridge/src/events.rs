//! Log event stream
//!
//! Components report through a `LogSink`, which publishes a `LogEvent` on a
//! broadcast channel and mirrors it to `tracing` at the matching level.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default capacity of the broadcast channel
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub source: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Tagged handle onto a shared log event channel
#[derive(Clone)]
pub struct LogSink {
    tx: broadcast::Sender<LogEvent>,
    source: Arc<str>,
}

impl LogSink {
    /// New channel with a sink tagged `source`
    pub fn new(source: &str) -> Self {
        let (tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            tx,
            source: Arc::from(source),
        }
    }

    /// Same channel, different source tag
    pub fn with_source(&self, source: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            source: Arc::from(source),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let source = &*self.source;
        match level {
            LogLevel::Debug => debug!(source, "{}", message),
            LogLevel::Info => info!(source, "{}", message),
            LogLevel::Warning => warn!(source, "{}", message),
            LogLevel::Error => error!(source, "{}", message),
        }

        // No subscribers is fine
        let _ = self.tx.send(LogEvent {
            source: self.source.to_string(),
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message);
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("source", &self.source)
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_emit_reaches_channel_and_tracing() {
        let sink = LogSink::new("service");
        let mut rx = sink.subscribe();
        let plc = sink.with_source("plc1");

        plc.warn("link down");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "plc1");
        assert_eq!(event.level, LogLevel::Warning);
        assert_eq!(event.message, "link down");
        assert!(logs_contain("link down"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = LogSink::new("service");
        sink.info("nobody listening");
    }
}
