// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger discovery.
//!
//! Finds the functions a backend exports. Backends either declare their
//! triggers up front or name a command that prints them as JSON.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::EmulatableBackend;
use crate::error::{Error, Result};
use crate::trigger::{TriggerDefinition, TriggerSpec};

/// How long a discovery command may run.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces trigger definitions from a backend's source.
#[async_trait]
pub trait SourceDiscovery: Send + Sync {
    async fn discover(
        &self,
        backend: &EmulatableBackend,
        env: &HashMap<String, String>,
    ) -> Result<Vec<TriggerDefinition>>;
}

/// Uses the backend's predefined triggers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PredefinedDiscovery;

#[async_trait]
impl SourceDiscovery for PredefinedDiscovery {
    async fn discover(
        &self,
        backend: &EmulatableBackend,
        _env: &HashMap<String, String>,
    ) -> Result<Vec<TriggerDefinition>> {
        backend.predefined_definitions().ok_or_else(|| {
            Error::Discovery(format!(
                "backend {} declares no predefined triggers",
                backend.functions_dir.display()
            ))
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryOutput {
    List(Vec<TriggerSpec>),
    Manifest { endpoints: Vec<TriggerSpec> },
}

/// Runs the backend's discovery command and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandDiscovery {
    timeout: Duration,
}

impl Default for CommandDiscovery {
    fn default() -> Self {
        Self {
            timeout: DISCOVERY_TIMEOUT,
        }
    }
}

impl CommandDiscovery {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse discovery output: a list of trigger specs, or an object with an
    /// `endpoints` list.
    pub fn parse(output: &str, codebase: &str) -> Result<Vec<TriggerDefinition>> {
        let parsed: DiscoveryOutput = serde_json::from_str(output.trim())
            .map_err(|e| Error::Discovery(format!("invalid discovery output: {}", e)))?;
        let specs = match parsed {
            DiscoveryOutput::List(specs) => specs,
            DiscoveryOutput::Manifest { endpoints } => endpoints,
        };
        Ok(specs.iter().flat_map(|spec| spec.expand(codebase)).collect())
    }
}

#[async_trait]
impl SourceDiscovery for CommandDiscovery {
    async fn discover(
        &self,
        backend: &EmulatableBackend,
        env: &HashMap<String, String>,
    ) -> Result<Vec<TriggerDefinition>> {
        let Some((program, args)) = backend.discovery_command.as_deref().and_then(<[String]>::split_first) else {
            return Err(Error::Discovery(format!(
                "backend {} has no discovery command",
                backend.functions_dir.display()
            )));
        };

        debug!(program = %program, dir = %backend.functions_dir.display(), "Running discovery command");
        let child = Command::new(program)
            .args(args)
            .current_dir(&backend.functions_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Discovery(format!("failed to run {}: {}", program, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Discovery(format!("{} timed out after {:?}", program, self.timeout)))??;

        if !output.status.success() {
            return Err(Error::Discovery(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let definitions = Self::parse(&String::from_utf8_lossy(&output.stdout), &backend.codebase)?;
        info!(codebase = %backend.codebase, count = definitions.len(), "Discovered functions");
        Ok(definitions)
    }
}

/// Predefined triggers when present, the discovery command otherwise.
#[derive(Debug, Default, Clone)]
pub struct BackendDiscovery {
    command: CommandDiscovery,
}

#[async_trait]
impl SourceDiscovery for BackendDiscovery {
    async fn discover(
        &self,
        backend: &EmulatableBackend,
        env: &HashMap<String, String>,
    ) -> Result<Vec<TriggerDefinition>> {
        if backend.predefined_triggers.is_some() {
            PredefinedDiscovery.discover(backend, env).await
        } else {
            self.command.discover(backend, env).await
        }
    }
}
