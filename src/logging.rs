//! The logging sink the core consumes as an external collaborator (spec §1),
//! plus the crate's own `tracing`-backed default implementation.

use std::fmt;

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Level {
    /// Diagnostic detail useful when investigating a specific pip.
    Debug,
    /// Routine information (e.g. a first-double-write-wins notice).
    Info,
    /// Non-fatal problems that were recovered from (injector retries,
    /// dump-capture failures).
    Warn,
    /// Problems surfaced to the caller as part of a terminal error.
    Error,
}

/// A single key-value field attached to a [`LogRecord`].
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name.
    pub key: &'static str,
    /// Field value, already formatted.
    pub value: String,
}

/// One structured log entry emitted by the core.
///
/// `event` is a short, stable, snake_case name (`"double_write_violation"`,
/// `"injector_retry"`, `"reader_eof"`) so that callers can match on it
/// without parsing a free-form message.
#[derive(Debug, Clone)]
pub struct LogRecord<'a> {
    /// Severity.
    pub level: Level,
    /// Stable event name.
    pub event: &'a str,
    /// Structured fields.
    pub fields: Vec<Field>,
}

impl<'a> LogRecord<'a> {
    /// Starts a new record at the given level and event name.
    pub fn new(level: Level, event: &'a str) -> Self {
        LogRecord {
            level,
            event,
            fields: Vec::new(),
        }
    }

    /// Attaches a field, builder-style.
    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push(Field {
            key,
            value: value.to_string(),
        });
        self
    }
}

/// Abstract logging sink. The core calls this for every diagnostic it
/// produces; it never assumes a particular telemetry backend.
pub trait LogSink: Send + Sync {
    /// Receives one structured record.
    fn log(&self, record: LogRecord<'_>);
}

/// Default [`LogSink`] that forwards to the `tracing` crate.
///
/// Callers are expected to install their own `tracing` subscriber; this sink
/// never initializes one itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, record: LogRecord<'_>) {
        let fields: Vec<String> = record
            .fields
            .iter()
            .map(|f| format!("{}={}", f.key, f.value))
            .collect();
        let fields = fields.join(" ");
        match record.level {
            Level::Debug => tracing::debug!(event = record.event, %fields),
            Level::Info => tracing::info!(event = record.event, %fields),
            Level::Warn => tracing::warn!(event = record.event, %fields),
            Level::Error => tracing::error!(event = record.event, %fields),
        }
    }
}

/// [`LogSink`] that discards everything; useful in tests that don't want
/// `tracing` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn log(&self, _record: LogRecord<'_>) {}
}
