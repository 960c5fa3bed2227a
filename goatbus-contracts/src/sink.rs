//! Logging sink surface. The core emits structured `tracing` events for its
//! own diagnostics; hosts that want bus activity in their own log pipeline
//! bind a [`LogSink`] instead of scraping subscriber output.

use std::fmt;

/// Severity carried to host log sinks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Host-facing logging sink.
pub trait LogSink: Send + Sync {
    /// Records one message. `target` identifies the bus component
    /// ("dispatch", "queues", "backpressure", ...).
    fn record(&self, level: LogLevel, target: &str, message: &str);
}

impl fmt::Debug for dyn LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}

/// Adapter that forwards bus messages to the `log` crate facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn record(&self, level: LogLevel, target: &str, message: &str) {
        match level {
            LogLevel::Debug => log::debug!(target: "goatbus", "{target}: {message}"),
            LogLevel::Info => log::info!(target: "goatbus", "{target}: {message}"),
            LogLevel::Warn => log::warn!(target: "goatbus", "{target}: {message}"),
            LogLevel::Error => log::error!(target: "goatbus", "{target}: {message}"),
        }
    }
}
