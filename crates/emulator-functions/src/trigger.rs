// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger definitions.
//!
//! A definition describes one deployed function in one region: how it is
//! invoked and which export of the source it runs. Sources declare
//! [`TriggerSpec`]s with a list of regions; they are expanded into one
//! [`TriggerDefinition`] per region.

use emulator_protocol::SignatureType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Region used when a source declares none.
pub const DEFAULT_REGION: &str = "us-central1";
/// Memory assumed when a source declares none.
pub const DEFAULT_MEMORY_MB: u32 = 256;
/// Timeout assumed when a source declares none.
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 60;
/// Codebase used when a backend declares none.
pub const DEFAULT_CODEBASE: &str = "default";

/// Label marking an HTTPS function as callable.
pub const CALLABLE_LABEL: &str = "deployment-callable";

/// Auth blocking event types.
pub const BEFORE_CREATE_EVENT: &str = "providers/cloud.auth/eventTypes/user.beforeCreate";
pub const BEFORE_SIGN_IN_EVENT: &str = "providers/cloud.auth/eventTypes/user.beforeSignIn";

static FUNCTION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]{0,62}$").expect("function name pattern is valid")
});

/// Generation of the functions platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Gcfv1,
    Gcfv2,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Gcfv1 => f.write_str("gcfv1"),
            Platform::Gcfv2 => f.write_str("gcfv2"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpsTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoker: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallableTrigger {}

/// An event source subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTrigger {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Eventarc channel; set for custom events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub event_filters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleTrigger {
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

/// Credentials forwarded to auth blocking functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingOptions {
    #[serde(default)]
    pub access_token: bool,
    #[serde(default)]
    pub id_token: bool,
    #[serde(default)]
    pub refresh_token: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingTrigger {
    pub event_type: String,
    #[serde(default)]
    pub options: BlockingOptions,
}

/// How a function is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    HttpsTrigger(HttpsTrigger),
    CallableTrigger(CallableTrigger),
    EventTrigger(EventTrigger),
    ScheduleTrigger(ScheduleTrigger),
    BlockingTrigger(BlockingTrigger),
}

/// A secret exposed to a function as an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEnvVar {
    pub key: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A function as declared by a source, before region expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    pub name: String,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub platform: Platform,
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    #[serde(default)]
    pub available_memory_mb: Option<u32>,
    #[serde(default)]
    pub secret_environment_variables: Vec<SecretEnvVar>,
}

/// One emulated function in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    /// `{region}-{name}`
    pub id: String,
    pub name: String,
    pub entry_point: String,
    pub region: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub timeout_seconds: u32,
    pub available_memory_mb: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_environment_variables: Vec<SecretEnvVar>,
    pub codebase: String,
}

impl TriggerSpec {
    /// Expand into one definition per region.
    pub fn expand(&self, codebase: &str) -> Vec<TriggerDefinition> {
        let regions = if self.regions.is_empty() {
            vec![DEFAULT_REGION.to_string()]
        } else {
            self.regions.clone()
        };

        regions
            .into_iter()
            .map(|region| TriggerDefinition {
                id: format!("{}-{}", region, self.name),
                name: self.name.clone(),
                entry_point: self.entry_point.clone().unwrap_or_else(|| self.name.clone()),
                region,
                platform: self.platform,
                kind: self.kind.clone(),
                labels: self.labels.clone(),
                timeout_seconds: self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
                available_memory_mb: self.available_memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
                secret_environment_variables: self.secret_environment_variables.clone(),
                codebase: codebase.to_string(),
            })
            .collect()
    }
}

impl TriggerDefinition {
    pub fn is_https(&self) -> bool {
        matches!(
            self.kind,
            TriggerKind::HttpsTrigger(_) | TriggerKind::CallableTrigger(_)
        )
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind, TriggerKind::CallableTrigger(_))
            || self.labels.get(CALLABLE_LABEL).map(String::as_str) == Some("true")
    }

    /// Event and scheduled triggers.
    pub fn is_background(&self) -> bool {
        matches!(
            self.kind,
            TriggerKind::EventTrigger(_) | TriggerKind::ScheduleTrigger(_)
        )
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, TriggerKind::BlockingTrigger(_))
    }

    pub fn event_trigger(&self) -> Option<&EventTrigger> {
        match &self.kind {
            TriggerKind::EventTrigger(trigger) => Some(trigger),
            _ => None,
        }
    }

    pub fn blocking_trigger(&self) -> Option<&BlockingTrigger> {
        match &self.kind {
            TriggerKind::BlockingTrigger(trigger) => Some(trigger),
            _ => None,
        }
    }

    /// Signature the runtime uses to adapt requests to the export.
    pub fn signature_type(&self) -> SignatureType {
        match self.kind {
            TriggerKind::HttpsTrigger(_)
            | TriggerKind::CallableTrigger(_)
            | TriggerKind::BlockingTrigger(_) => SignatureType::Http,
            _ if self.platform == Platform::Gcfv2 => SignatureType::Cloudevent,
            _ => SignatureType::Event,
        }
    }

    /// Key under which the trigger is registered.
    ///
    /// Background triggers carry the registry generation so that companion
    /// emulators holding a stale registration hit a missing key after a
    /// reload; custom event triggers additionally carry their channel.
    pub fn trigger_key(&self, generation: u64) -> String {
        match &self.kind {
            TriggerKind::EventTrigger(event) => match &event.channel {
                Some(channel) => format!("{}-{}-{}", self.id, generation, channel),
                None => format!("{}-{}", self.id, generation),
            },
            TriggerKind::ScheduleTrigger(_) => format!("{}-{}", self.id, generation),
            _ => self.id.clone(),
        }
    }

    /// Whether another definition would be served by the same running code.
    pub fn same_code_as(&self, other: &TriggerDefinition) -> bool {
        self.entry_point == other.entry_point && self.event_trigger() == other.event_trigger()
    }
}

/// Whether a name is a valid function id.
pub fn is_valid_function_name(name: &str) -> bool {
    FUNCTION_NAME.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(kind: TriggerKind) -> TriggerDefinition {
        TriggerSpec {
            name: "fn".to_string(),
            entry_point: None,
            regions: vec![],
            platform: Platform::Gcfv1,
            kind,
            labels: BTreeMap::new(),
            timeout_seconds: None,
            available_memory_mb: None,
            secret_environment_variables: vec![],
        }
        .expand(DEFAULT_CODEBASE)
        .remove(0)
    }

    #[test]
    fn test_expand_defaults() {
        let def = definition(TriggerKind::HttpsTrigger(HttpsTrigger::default()));
        assert_eq!(def.id, "us-central1-fn");
        assert_eq!(def.entry_point, "fn");
        assert_eq!(def.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(def.available_memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(def.codebase, DEFAULT_CODEBASE);
    }

    #[test]
    fn test_expand_multiple_regions() {
        let spec = TriggerSpec {
            name: "api".to_string(),
            entry_point: Some("handler".to_string()),
            regions: vec!["europe-west1".to_string(), "asia-east1".to_string()],
            platform: Platform::Gcfv2,
            kind: TriggerKind::HttpsTrigger(HttpsTrigger::default()),
            labels: BTreeMap::new(),
            timeout_seconds: Some(10),
            available_memory_mb: Some(512),
            secret_environment_variables: vec![],
        };
        let ids: Vec<_> = spec.expand("web").into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["europe-west1-api", "asia-east1-api"]);
    }

    #[test]
    fn test_trigger_key_variants() {
        let https = definition(TriggerKind::HttpsTrigger(HttpsTrigger::default()));
        assert_eq!(https.trigger_key(3), "us-central1-fn");

        let event = definition(TriggerKind::EventTrigger(EventTrigger {
            event_type: "google.pubsub.topic.publish".to_string(),
            ..Default::default()
        }));
        assert_eq!(event.trigger_key(3), "us-central1-fn-3");

        let custom = definition(TriggerKind::EventTrigger(EventTrigger {
            event_type: "com.example.custom".to_string(),
            channel: Some("projects/p/locations/us-central1/channels/firebase".to_string()),
            ..Default::default()
        }));
        assert_eq!(
            custom.trigger_key(1),
            "us-central1-fn-1-projects/p/locations/us-central1/channels/firebase"
        );
    }

    #[test]
    fn test_signature_types() {
        let mut def = definition(TriggerKind::EventTrigger(EventTrigger::default()));
        assert_eq!(def.signature_type(), SignatureType::Event);
        def.platform = Platform::Gcfv2;
        assert_eq!(def.signature_type(), SignatureType::Cloudevent);

        let blocking = definition(TriggerKind::BlockingTrigger(BlockingTrigger {
            event_type: BEFORE_CREATE_EVENT.to_string(),
            options: BlockingOptions::default(),
        }));
        assert_eq!(blocking.signature_type(), SignatureType::Http);
    }

    #[test]
    fn test_callable_by_label() {
        let mut def = definition(TriggerKind::HttpsTrigger(HttpsTrigger::default()));
        assert!(!def.is_callable());
        def.labels.insert(CALLABLE_LABEL.to_string(), "true".to_string());
        assert!(def.is_callable());
        assert!(def.is_https());
    }

    #[test]
    fn test_function_name_validation() {
        assert!(is_valid_function_name("helloWorld"));
        assert!(is_valid_function_name("a-b_c1"));
        assert!(!is_valid_function_name("1abc"));
        assert!(!is_valid_function_name("has space"));
        assert!(!is_valid_function_name(&"a".repeat(64)));
    }

    #[test]
    fn test_definition_json_shape() {
        let json = serde_json::json!({
            "name": "onUpload",
            "regions": ["us-east1"],
            "eventTrigger": {
                "eventType": "google.storage.object.finalize",
                "resource": "projects/_/buckets/my-bucket"
            }
        });
        let spec: TriggerSpec = serde_json::from_value(json).unwrap();
        let def = spec.expand(DEFAULT_CODEBASE).remove(0);
        assert_eq!(def.id, "us-east1-onUpload");
        assert!(def.is_background());
        assert_eq!(
            def.event_trigger().unwrap().resource.as_deref(),
            Some("projects/_/buckets/my-bucket")
        );
    }
}
