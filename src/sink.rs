//! Leveled message sink the execution engine reports through
//!
//! The engine never decides how messages are rendered or stored; it hands a
//! [`Level`] and a message to a [`LogSink`]. [`StdLogSink`] forwards to the
//! `log` facade, [`RecordingSink`] keeps messages in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// Severity attached to a message or an error rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Swallow the message entirely
    Ignore,
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
    Critical,
    Fatal,
}

impl Level {
    /// Whether a line at this level counts towards the error tally
    pub fn is_error(self) -> bool {
        matches!(self, Level::Error | Level::Critical | Level::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Ignore => "ignore",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Fatal => "fatal",
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Info
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for leveled harness messages
///
/// Implementations are shared between invocations and must serialize their
/// own writes.
pub trait LogSink: Send + Sync {
    /// Submit a message at the given level
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn warning(&self, message: &str) {
        self.log(Level::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn critical(&self, message: &str) {
        self.log(Level::Critical, message);
    }

    /// Record a fatal message. Terminating is the caller's job.
    fn fatal(&self, message: &str) {
        self.log(Level::Fatal, message);
    }
}

/// Sink that forwards everything to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct StdLogSink;

impl LogSink for StdLogSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Ignore => {}
            Level::Debug => log::debug!("{}", message),
            Level::Info => log::info!("{}", message),
            Level::Warning => log::warn!("{}", message),
            Level::Error => log::error!("{}", message),
            Level::Critical => log::error!("CRITICAL: {}", message),
            Level::Fatal => log::error!("FATAL: {}", message),
        }
    }
}

/// A minimal in-memory sink, mostly for tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<(Level, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn records(&self) -> Vec<(Level, String)> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages recorded at exactly `level`
    pub fn messages_at(&self, level: Level) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    /// Whether any record at `level` contains `needle`
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl LogSink for RecordingSink {
    fn log(&self, level: Level, message: &str) {
        if level == Level::Ignore {
            return;
        }
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.push((level, message.to_string()));
    }
}
