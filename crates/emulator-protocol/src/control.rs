// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages and well-known names shared between the emulator and runtimes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Path a runtime answers once its socket server is listening.
pub const HEALTH_CHECK_PATH: &str = "/__/health";

/// Header carrying the decoded caller identity for callable functions.
pub const CALLABLE_AUTH_HEADER: &str = "x-callable-context-auth";

/// Header preserving the caller's original `Authorization` value.
pub const ORIGINAL_AUTH_HEADER: &str = "x-original-auth";

/// How a runtime should adapt the incoming request to the user function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    /// Plain request/response handler.
    Http,
    /// Legacy background event handler.
    Event,
    /// CloudEvents handler.
    Cloudevent,
}

impl SignatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureType::Http => "http",
            SignatureType::Event => "event",
            SignatureType::Cloudevent => "cloudevent",
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent over the control channel before each request when a debugger is
/// attached: the runtime is shared across functions, so it must be told which
/// export to load for the next request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugBundle {
    pub function_target: String,
    pub function_signature: SignatureType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_bundle_wire_shape() {
        let bundle = DebugBundle {
            function_target: "helloWorld".to_string(),
            function_signature: SignatureType::Cloudevent,
        };
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "functionTarget": "helloWorld",
                "functionSignature": "cloudevent"
            })
        );
    }

    #[test]
    fn test_signature_display() {
        assert_eq!(SignatureType::Http.to_string(), "http");
        assert_eq!(SignatureType::Event.to_string(), "event");
    }
}
