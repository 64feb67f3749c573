// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured log records emitted by runtime processes.
//!
//! A runtime writes one JSON object per line:
//!
//! ```text
//! {"level":"INFO","type":"function-log","text":"hello","data":{},"timestamp":"..."}
//! ```
//!
//! Any line that is not such an object (plain `console.log` output, stack
//! traces) becomes a `USER` record carrying the raw text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Type tag used for runtime lifecycle notices.
pub const RUNTIME_STATUS_TYPE: &str = "runtime-status";

/// Severity of a runtime log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    /// Warning shown once per emulator session.
    WarnOnce,
    /// Output written by user code.
    User,
    /// Unrecoverable runtime failure. The emulator kills the process.
    Fatal,
    /// Emulator-internal notice.
    System,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::WarnOnce => "WARN_ONCE",
            LogLevel::User => "USER",
            LogLevel::Fatal => "FATAL",
            LogLevel::System => "SYSTEM",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "WARN_ONCE" => Ok(LogLevel::WarnOnce),
            "USER" => Ok(LogLevel::User),
            "FATAL" => Ok(LogLevel::Fatal),
            "SYSTEM" => Ok(LogLevel::System),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One log record from a runtime process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeLog {
    pub level: LogLevel,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub log_type: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Loose shape used when parsing, so that malformed records fall back to text.
#[derive(Deserialize)]
struct RawLog {
    level: Option<String>,
    #[serde(rename = "type")]
    log_type: Option<String>,
    text: Option<String>,
    data: Option<serde_json::Value>,
    timestamp: Option<String>,
}

impl RuntimeLog {
    pub fn new(level: LogLevel, log_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level,
            log_type: Some(log_type.into()),
            text: text.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    /// A `SYSTEM` record, used for emulator-side lifecycle notices.
    pub fn system(log_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(LogLevel::System, log_type, text)
    }

    /// The notice published right before a runtime is killed after a fatal log.
    pub fn killed() -> Self {
        Self::system(RUNTIME_STATUS_TYPE, "killed")
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse one output line. Never fails: anything that is not a complete
    /// structured record becomes a `USER` record with the line as text.
    pub fn from_line(line: &str) -> Self {
        let parsed = serde_json::from_str::<RawLog>(line).ok().and_then(|raw| {
            let level = raw.level.as_deref()?.parse::<LogLevel>().ok()?;
            let log_type = raw.log_type?;
            let text = raw.text?;
            let timestamp = raw
                .timestamp
                .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Some(RuntimeLog {
                level,
                log_type: Some(log_type),
                text,
                data: raw.data,
                timestamp,
            })
        });

        parsed.unwrap_or_else(|| RuntimeLog {
            level: LogLevel::User,
            log_type: None,
            text: line.to_string(),
            data: None,
            timestamp: Utc::now(),
        })
    }

    /// Serialize as a single JSON line without terminator.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.text.clone())
    }

    pub fn is_fatal(&self) -> bool {
        self.level == LogLevel::Fatal
    }
}
