// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment for runtime processes.
//!
//! Layers, later ones winning:
//!
//! 1. user env files in the functions directory
//! 2. system variables describing the project and the trigger
//! 3. emulator variables: debug flags, companion hosts, `FIREBASE_CONFIG`
//! 4. the backend's own `env`
//! 5. local secrets from `.secret.local`
//! 6. `PORT`, the runtime's socket path

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, error, warn};

use crate::backend::EmulatableBackend;
use crate::config::{Companion, CompanionEmulators};
use crate::error::Result;
use crate::trigger::TriggerDefinition;

/// File holding local overrides for secret environment variables.
pub const SECRET_LOCAL_FILE: &str = ".secret.local";

/// Project-level inputs to env assembly.
#[derive(Debug, Clone)]
pub struct EnvContext<'a> {
    pub project_id: &'a str,
    pub project_alias: Option<&'a str>,
    pub companions: &'a CompanionEmulators,
    /// A debugger is attached
    pub debug: bool,
    pub storage_bucket: Option<&'a str>,
}

/// Env files read from the functions directory, in load order.
pub fn user_env_files(project_id: &str, alias: Option<&str>) -> Vec<String> {
    let mut files = vec![".env".to_string(), format!(".env.{}", project_id)];
    if let Some(alias) = alias
        && alias != project_id
    {
        files.push(format!(".env.{}", alias));
    }
    files.push(".env.local".to_string());
    files
}

/// Parse one dotenv file. A missing file yields nothing.
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mut vars = BTreeMap::new();
    for item in iter {
        let (key, value) = item?;
        vars.insert(key, value);
    }
    Ok(vars)
}

/// Variables from the user's env files; later files override earlier ones.
pub fn load_user_envs(functions_dir: &Path, project_id: &str, alias: Option<&str>) -> Result<BTreeMap<String, String>> {
    let mut envs = BTreeMap::new();
    for name in user_env_files(project_id, alias) {
        let path = functions_dir.join(&name);
        let vars = read_env_file(&path)?;
        if !vars.is_empty() {
            debug!(file = %path.display(), count = vars.len(), "Loaded user environment");
        }
        envs.extend(vars);
    }
    Ok(envs)
}

/// Secrets from `.secret.local`. Read failures other than a missing file
/// are logged and yield nothing.
pub fn load_secret_envs(functions_dir: &Path) -> BTreeMap<String, String> {
    let path = functions_dir.join(SECRET_LOCAL_FILE);
    match read_env_file(&path) {
        Ok(vars) => vars,
        Err(e) => {
            error!(file = %path.display(), error = %e, "Failed to read local secrets file");
            BTreeMap::new()
        }
    }
}

pub fn system_envs(project_id: &str, trigger: Option<&TriggerDefinition>, debug: bool) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    envs.insert("GCLOUD_PROJECT".to_string(), project_id.to_string());
    envs.insert("K_REVISION".to_string(), "1".to_string());
    if let Some(trigger) = trigger {
        if !debug {
            envs.insert(
                "FUNCTIONS_EMULATOR_TIMEOUT_SECONDS".to_string(),
                trigger.timeout_seconds.to_string(),
            );
        }
        envs.insert("FUNCTION_TARGET".to_string(), trigger.entry_point.clone());
        envs.insert(
            "FUNCTION_SIGNATURE_TYPE".to_string(),
            trigger.signature_type().to_string(),
        );
        envs.insert("K_SERVICE".to_string(), trigger.name.clone());
    }
    envs
}

pub fn emulator_envs(ctx: &EnvContext<'_>) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    envs.insert("FUNCTIONS_EMULATOR".to_string(), "true".to_string());
    envs.insert("TZ".to_string(), "UTC".to_string());
    envs.insert("FIREBASE_DEBUG_MODE".to_string(), "true".to_string());
    envs.insert(
        "FIREBASE_DEBUG_FEATURES".to_string(),
        serde_json::json!({ "skipTokenVerification": true, "enableCors": true }).to_string(),
    );
    for (var, host) in ctx.companions.env_pairs() {
        envs.insert(var.to_string(), host);
    }
    if let Some(host) = ctx.companions.host(Companion::Storage) {
        envs.insert("STORAGE_EMULATOR_HOST".to_string(), format!("http://{}", host));
    }
    if ctx.debug {
        envs.insert("FUNCTION_DEBUG_MODE".to_string(), "true".to_string());
    }
    envs.insert("FIREBASE_CONFIG".to_string(), firebase_config(ctx));
    envs
}

/// `FIREBASE_CONFIG` pointing the admin SDK at the emulated database.
pub fn firebase_config(ctx: &EnvContext<'_>) -> String {
    let database_url = ctx
        .companions
        .host(Companion::Database)
        .map(|host| format!("http://{}/?ns={}", host, ctx.project_id));
    let storage_bucket = ctx
        .storage_bucket
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}.appspot.com", ctx.project_id));
    serde_json::json!({
        "projectId": ctx.project_id,
        "storageBucket": storage_bucket,
        "databaseURL": database_url,
    })
    .to_string()
}

/// Full environment for a runtime serving `trigger`, or a shared runtime
/// when `trigger` is `None`.
pub fn runtime_env(
    ctx: &EnvContext<'_>,
    backend: &EmulatableBackend,
    trigger: Option<&TriggerDefinition>,
    socket_path: &Path,
) -> HashMap<String, String> {
    let user = load_user_envs(&backend.functions_dir, ctx.project_id, ctx.project_alias).unwrap_or_else(|e| {
        warn!(dir = %backend.functions_dir.display(), error = %e, "Failed to load local environment variables");
        BTreeMap::new()
    });

    let mut env: HashMap<String, String> = HashMap::new();
    env.extend(user);
    env.extend(system_envs(ctx.project_id, trigger, ctx.debug));
    env.extend(emulator_envs(ctx));
    env.extend(backend.env.clone());

    let secrets = load_secret_envs(&backend.functions_dir);
    if let Some(trigger) = trigger {
        for secret in &trigger.secret_environment_variables {
            if !secrets.contains_key(&secret.key) {
                warn!(
                    function = %trigger.id,
                    key = %secret.key,
                    "Secret has no local override in {}",
                    SECRET_LOCAL_FILE
                );
            }
        }
    }
    env.extend(secrets);

    env.insert("PORT".to_string(), socket_path.display().to_string());
    env
}
