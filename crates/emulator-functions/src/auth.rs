// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller identity for callable functions.
//!
//! Callable functions read the caller from a decoded ID token. Tokens are
//! not verified here; the claims are decoded and handed to the runtime in
//! [`CALLABLE_AUTH_HEADER`], and the bearer token is moved out of the way so
//! the runtime does not try to verify it either.

use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use emulator_protocol::{CALLABLE_AUTH_HEADER, ORIGINAL_AUTH_HEADER};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::trigger::{Platform, TriggerDefinition};

static PADDED_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=+\.").expect("padding pattern is valid"));

/// Whether requests to this function get the identity shim.
pub fn needs_callable_auth(def: &TriggerDefinition) -> bool {
    def.is_callable() && def.platform != Platform::Gcfv2
}

/// Decode the claims of a JWT without checking its signature.
///
/// Tolerates padded segments. The `uid` claim is filled from `sub`.
pub fn decode_unverified_claims(token: &str) -> Option<serde_json::Value> {
    let token = PADDED_SEGMENT.replace_all(token, ".");
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let mut claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;

    let sub = claims.get("sub").cloned();
    if let (Some(map), Some(sub)) = (claims.as_object_mut(), sub) {
        map.insert("uid".to_string(), sub);
    }
    Some(claims)
}

/// Replace a bearer token with the decoded caller identity.
///
/// Leaves the headers untouched when there is no bearer token or it cannot
/// be decoded.
pub fn apply_callable_auth(headers: &mut HeaderMap) {
    let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
    else {
        return;
    };

    let Some(claims) = decode_unverified_claims(&token) else {
        warn!("Callable request carried an ID token that could not be decoded");
        return;
    };

    let context = serde_json::json!({
        "uid": claims.get("uid").cloned().unwrap_or(serde_json::Value::Null),
        "token": claims,
    });
    let encoded = urlencoding::encode(&context.to_string()).into_owned();
    let Ok(value) = HeaderValue::from_str(&encoded) else {
        return;
    };

    debug!("Applying callable identity from ID token");
    if let Some(original) = headers.remove(AUTHORIZATION) {
        headers.insert(ORIGINAL_AUTH_HEADER, original);
    }
    headers.insert(CALLABLE_AUTH_HEADER, value);
}
