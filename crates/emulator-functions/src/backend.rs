// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Emulatable backends: source directories the emulator serves functions from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::logging::ExtensionLogInfo;
use crate::trigger::{DEFAULT_CODEBASE, SecretEnvVar, TriggerDefinition, TriggerSpec};

/// Runtime launched when a backend names none.
pub const DEFAULT_RUNTIME_BINARY: &str = "node";

fn default_codebase() -> String {
    DEFAULT_CODEBASE.to_string()
}

fn default_true() -> bool {
    true
}

/// A functions source directory and how to run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmulatableBackend {
    pub functions_dir: PathBuf,
    #[serde(default = "default_codebase")]
    pub codebase: String,
    /// Environment declared for the backend itself
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secret_env: Vec<SecretEnvVar>,
    /// Runtime executable, `node` when unset
    #[serde(default)]
    pub runtime_binary: Option<PathBuf>,
    /// Arguments passed to the runtime, typically its entry script
    #[serde(default)]
    pub runtime_args: Vec<String>,
    /// Triggers declared up front; skips discovery when present
    #[serde(default)]
    pub predefined_triggers: Option<Vec<TriggerSpec>>,
    /// Command printing the backend's trigger specs as JSON
    #[serde(default)]
    pub discovery_command: Option<Vec<String>>,
    /// Reload triggers when sources change
    #[serde(default = "default_true")]
    pub watch: bool,
    #[serde(default)]
    pub extension_instance_id: Option<String>,
    #[serde(default)]
    pub extension_version: Option<String>,
    #[serde(default)]
    pub extension_ref: Option<String>,
}

impl EmulatableBackend {
    /// A backend with defaults for everything but its directory.
    pub fn new(functions_dir: impl Into<PathBuf>) -> Self {
        Self {
            functions_dir: functions_dir.into(),
            codebase: default_codebase(),
            env: BTreeMap::new(),
            secret_env: Vec::new(),
            runtime_binary: None,
            runtime_args: Vec::new(),
            predefined_triggers: None,
            discovery_command: None,
            watch: true,
            extension_instance_id: None,
            extension_version: None,
            extension_ref: None,
        }
    }

    /// Load backend declarations from a JSON file holding an array.
    pub fn load_all(path: &Path) -> Result<Vec<EmulatableBackend>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidBackend(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut backends: Vec<EmulatableBackend> = serde_json::from_str(&raw)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for backend in &mut backends {
            if backend.functions_dir.is_relative() {
                backend.functions_dir = base.join(&backend.functions_dir);
            }
        }
        Ok(backends)
    }

    pub fn runtime_program(&self) -> PathBuf {
        self.runtime_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_BINARY))
    }

    /// Runtime arguments, with a debugger flag first when a port is given.
    pub fn runtime_arguments(&self, inspect: Option<(&str, u16)>) -> Vec<String> {
        let mut args = Vec::with_capacity(self.runtime_args.len() + 1);
        if let Some((host, port)) = inspect {
            args.push(format!("--inspect={}:{}", host, port));
        }
        args.extend(self.runtime_args.iter().cloned());
        args
    }

    pub fn is_extension(&self) -> bool {
        self.extension_instance_id.is_some()
    }

    pub fn log_info(&self) -> ExtensionLogInfo {
        ExtensionLogInfo {
            instance_id: self.extension_instance_id.clone(),
            reference: self.extension_ref.clone(),
        }
    }

    /// Predefined triggers expanded by region.
    pub fn predefined_definitions(&self) -> Option<Vec<TriggerDefinition>> {
        self.predefined_triggers.as_ref().map(|specs| {
            specs
                .iter()
                .flat_map(|spec| spec.expand(&self.codebase))
                .collect()
        })
    }

    /// Backend environment with secrets shown as their version names.
    pub fn display_env(&self, project_id: &str) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        for secret in &self.secret_env {
            let project = secret.project_id.as_deref().unwrap_or(project_id);
            let version = secret.version.as_deref().unwrap_or("latest");
            env.insert(
                secret.key.clone(),
                format!("projects/{}/secrets/{}/versions/{}", project, secret.secret, version),
            );
        }
        env
    }
}

/// Summary of a backend for inspection tools.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub directory: String,
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_version: Option<String>,
    pub function_triggers: Vec<TriggerDefinition>,
}
