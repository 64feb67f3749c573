// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forwarding of runtime logs into the emulator's tracing output.

use emulator_protocol::{LogLevel, RuntimeLog};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tracing target for logs produced by user functions.
pub const FUNCTION_LOG_TARGET: &str = "functions";

/// Identifies the extension a function belongs to, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionLogInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Log sink for one function, or for the emulator itself when a runtime is
/// shared across functions.
#[derive(Debug, Clone)]
pub struct FunctionLogger {
    function: Option<String>,
    extension: ExtensionLogInfo,
    warned: Arc<Mutex<HashSet<String>>>,
}

impl FunctionLogger {
    pub fn for_function(trigger_id: impl Into<String>, extension: ExtensionLogInfo) -> Self {
        Self {
            function: Some(trigger_id.into()),
            extension,
            warned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn for_emulator() -> Self {
        Self {
            function: None,
            extension: ExtensionLogInfo::default(),
            warned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Share `WARN_ONCE` deduplication with another logger.
    pub fn with_warned(mut self, warned: Arc<Mutex<HashSet<String>>>) -> Self {
        self.warned = warned;
        self
    }

    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }

    /// Emit one runtime log at the matching tracing level.
    ///
    /// Returns false when the record was suppressed.
    pub fn handle_runtime_log(&self, log: &RuntimeLog) -> bool {
        let function = self.function.as_deref().unwrap_or("emulator");
        let extension = self.extension.instance_id.as_deref().unwrap_or("");

        match log.level {
            LogLevel::Debug | LogLevel::System => {
                debug!(target: FUNCTION_LOG_TARGET, function, extension, kind = ?log.log_type, "{}", log.text)
            }
            LogLevel::Info | LogLevel::User => {
                info!(target: FUNCTION_LOG_TARGET, function, extension, "{}", log.text)
            }
            LogLevel::Warn => warn!(target: FUNCTION_LOG_TARGET, function, extension, "{}", log.text),
            LogLevel::WarnOnce => {
                if !self.warned.lock().insert(log.text.clone()) {
                    return false;
                }
                warn!(target: FUNCTION_LOG_TARGET, function, extension, "{}", log.text)
            }
            LogLevel::Fatal => {
                error!(target: FUNCTION_LOG_TARGET, function, extension, "{}", log.text)
            }
        }
        true
    }
}
