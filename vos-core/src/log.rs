//! Log lines republished to collaborators.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a [`LogLine`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// A line read from the guest serial console.
    Console,
    /// A diagnostic produced by the controller or one of its monitors.
    Controller,
}

/// Severity of a [`LogLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One line on the controller's log channel.
///
/// Lines from the console are totally ordered among themselves; no order is
/// promised between console lines and controller diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct LogLine {
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LogLine {
    /// A console line, always at `Info`.
    pub fn console(message: impl Into<String>) -> Self {
        Self::new(LogSource::Console, LogLevel::Info, message)
    }

    /// A controller diagnostic.
    pub fn controller(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(LogSource::Controller, level, message)
    }

    fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self { source, level, message: message.into(), at: Utc::now() }
    }
}
