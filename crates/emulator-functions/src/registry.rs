// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger registry.
//!
//! Maps trigger keys to records and event keys to the triggers subscribed
//! to them through multicast. Owned by the emulator behind a lock; the
//! registry itself is plain data.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::backend::EmulatableBackend;
use crate::trigger::{BEFORE_CREATE_EVENT, BEFORE_SIGN_IN_EVENT, BlockingOptions, TriggerDefinition};

/// A loaded trigger.
#[derive(Debug, Clone)]
pub struct TriggerRecord {
    pub def: Arc<TriggerDefinition>,
    pub enabled: bool,
    pub backend: Arc<EmulatableBackend>,
    /// Registration with its event source failed or was not possible
    pub ignored: bool,
    /// Public URL for HTTPS triggers
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingFunctionUri {
    pub function_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingTriggers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_create: Option<BlockingFunctionUri>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_sign_in: Option<BlockingFunctionUri>,
}

/// Auth blocking functions configuration pushed to the auth emulator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingFunctionsConfig {
    pub triggers: BlockingTriggers,
    pub forward_inbound_credentials: BlockingOptions,
}

impl BlockingFunctionsConfig {
    /// Point the blocking event at `url`. Returns false for other event types.
    pub fn register(&mut self, event_type: &str, url: String, options: BlockingOptions) -> bool {
        let uri = Some(BlockingFunctionUri { function_uri: url });
        match event_type {
            BEFORE_CREATE_EVENT => self.triggers.before_create = uri,
            BEFORE_SIGN_IN_EVENT => self.triggers.before_sign_in = uri,
            _ => return false,
        }
        self.forward_inbound_credentials = options;
        true
    }
}

/// Loaded triggers and multicast subscriptions.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    records: BTreeMap<String, TriggerRecord>,
    multicast: HashMap<String, Vec<String>>,
    generation: u64,
    blocking: BlockingFunctionsConfig,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation, bumped on every reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn trigger_key(&self, def: &TriggerDefinition) -> String {
        def.trigger_key(self.generation)
    }

    /// Insert or replace a record. Returns its key.
    pub fn add(&mut self, record: TriggerRecord) -> String {
        let key = self.trigger_key(&record.def);
        self.records.insert(key.clone(), record);
        key
    }

    /// The record under `key`, only if enabled.
    pub fn get_enabled(&self, key: &str) -> Option<&TriggerRecord> {
        self.records.get(key).filter(|record| record.enabled)
    }

    /// Keys of enabled records, for "valid functions are" messages.
    pub fn enabled_keys(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, record)| record.enabled)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn definitions(&self) -> Vec<Arc<TriggerDefinition>> {
        self.records.values().map(|record| record.def.clone()).collect()
    }

    /// Definitions served from non-extension backends of a codebase.
    pub fn definitions_for_codebase(&self, codebase: &str) -> Vec<TriggerDefinition> {
        self.records
            .values()
            .filter(|record| record.backend.codebase == codebase && !record.backend.is_extension())
            .map(|record| (*record.def).clone())
            .collect()
    }

    /// Whether an enabled record already serves the same code for the same id.
    pub fn has_enabled_match(&self, def: &TriggerDefinition) -> bool {
        self.records
            .values()
            .any(|record| record.enabled && record.def.id == def.id && record.def.same_code_as(def))
    }

    /// Disable every background trigger and drop multicast subscriptions.
    /// Returns the number of triggers disabled.
    pub fn disable_background(&mut self) -> usize {
        let mut disabled = 0;
        for record in self.records.values_mut() {
            if record.def.is_background() && record.enabled {
                record.enabled = false;
                disabled += 1;
            }
        }
        self.multicast.clear();
        disabled
    }

    /// Subscribe a trigger to an event key.
    pub fn add_multicast(&mut self, event_key: impl Into<String>, trigger_key: impl Into<String>) {
        let trigger_key = trigger_key.into();
        let subscribers = self.multicast.entry(event_key.into()).or_default();
        if !subscribers.contains(&trigger_key) {
            subscribers.push(trigger_key);
        }
    }

    /// Enabled trigger keys subscribed to an event key.
    pub fn multicast_targets(&self, event_key: &str) -> Vec<String> {
        self.multicast
            .get(event_key)
            .map(|keys| {
                keys.iter()
                    .filter(|key| self.get_enabled(key).is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn blocking_config(&self) -> &BlockingFunctionsConfig {
        &self.blocking
    }

    pub fn blocking_config_mut(&mut self) -> &mut BlockingFunctionsConfig {
        &mut self.blocking
    }

    pub fn reset_blocking_config(&mut self) {
        self.blocking = BlockingFunctionsConfig::default();
    }

    /// Replace everything with the given definitions, all enabled.
    pub fn replace_all(&mut self, definitions: Vec<TriggerDefinition>, backend: Arc<EmulatableBackend>) {
        self.records.clear();
        self.multicast.clear();
        for def in definitions {
            self.add(TriggerRecord {
                def: Arc::new(def),
                enabled: true,
                backend: backend.clone(),
                ignored: false,
                url: None,
            });
        }
    }
}
