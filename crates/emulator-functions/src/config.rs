// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for emulator-functions.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::pool::ExecutionMode;

/// Emulators that functions can talk to and receive events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Companion {
    Firestore,
    Database,
    Pubsub,
    Auth,
    Storage,
    Eventarc,
}

impl Companion {
    pub const ALL: [Companion; 6] = [
        Companion::Firestore,
        Companion::Database,
        Companion::Pubsub,
        Companion::Auth,
        Companion::Storage,
        Companion::Eventarc,
    ];

    /// Variable holding the companion's `host:port`, read here and passed
    /// on to runtimes.
    pub fn host_env_var(&self) -> &'static str {
        match self {
            Companion::Firestore => "FIRESTORE_EMULATOR_HOST",
            Companion::Database => "FIREBASE_DATABASE_EMULATOR_HOST",
            Companion::Pubsub => "PUBSUB_EMULATOR_HOST",
            Companion::Auth => "FIREBASE_AUTH_EMULATOR_HOST",
            Companion::Storage => "FIREBASE_STORAGE_EMULATOR_HOST",
            Companion::Eventarc => "CLOUD_EVENTARC_EMULATOR_HOST",
        }
    }
}

/// Addresses of running companion emulators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanionEmulators {
    hosts: HashMap<Companion, String>,
}

impl CompanionEmulators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every companion host variable that is set.
    pub fn from_env() -> Self {
        let mut emulators = Self::new();
        for companion in Companion::ALL {
            if let Ok(host) = std::env::var(companion.host_env_var())
                && !host.is_empty()
            {
                emulators.hosts.insert(companion, host);
            }
        }
        emulators
    }

    pub fn with(mut self, companion: Companion, host: impl Into<String>) -> Self {
        self.hosts.insert(companion, host.into());
        self
    }

    pub fn host(&self, companion: Companion) -> Option<&str> {
        self.hosts.get(&companion).map(String::as_str)
    }

    /// Base URL of a companion, `http://host:port`.
    pub fn url(&self, companion: Companion) -> Option<String> {
        self.host(companion).map(|host| format!("http://{}", host))
    }

    pub fn is_running(&self, companion: Companion) -> bool {
        self.hosts.contains_key(&companion)
    }

    /// `(variable, host)` for every running companion.
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        Companion::ALL
            .iter()
            .filter_map(|c| self.host(*c).map(|h| (c.host_env_var(), h.to_string())))
            .collect()
    }
}

/// Emulator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project the emulator serves
    pub project_id: String,
    /// Optional project alias, used to pick `.env.<alias>` files
    pub project_alias: Option<String>,
    /// Interface the HTTP hub binds to
    pub host: String,
    /// Port the HTTP hub binds to
    pub port: u16,
    /// Debugger port; enables sequential mode and `--inspect`
    pub debug_port: Option<u16>,
    /// Upper bound on live workers per trigger, 0 for unlimited
    pub max_workers_per_key: usize,
    /// Upper bound on concurrently running tasks, 0 for unlimited
    pub max_concurrency: usize,
    /// JSON file declaring the backends to serve
    pub backends_path: PathBuf,
    /// Directory for runtime sockets
    pub socket_dir: PathBuf,
    /// Suppress informational output
    pub quiet: bool,
    /// Companion emulator addresses
    pub companions: CompanionEmulators,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let project_id = std::env::var("FUNCTIONS_EMULATOR_PROJECT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("FUNCTIONS_EMULATOR_PROJECT_ID"))?;

        let project_alias = std::env::var("FUNCTIONS_EMULATOR_PROJECT_ALIAS").ok();

        let host = std::env::var("FUNCTIONS_EMULATOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port: u16 = std::env::var("FUNCTIONS_EMULATOR_PORT")
            .unwrap_or_else(|_| "5001".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let debug_port = match std::env::var("FUNCTIONS_EMULATOR_DEBUG_PORT") {
            Ok(value) => Some(value.parse().map_err(|_| ConfigError::InvalidPort)?),
            Err(_) => None,
        };

        let max_workers_per_key = parse_count("FUNCTIONS_EMULATOR_MAX_WORKERS_PER_KEY", 8)?;
        let max_concurrency = parse_count("FUNCTIONS_EMULATOR_MAX_CONCURRENCY", 0)?;

        let backends_path = PathBuf::from(
            std::env::var("FUNCTIONS_EMULATOR_BACKENDS").unwrap_or_else(|_| "functions.json".to_string()),
        );

        let socket_dir = std::env::var("FUNCTIONS_EMULATOR_SOCKET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        let quiet = std::env::var("FUNCTIONS_EMULATOR_QUIET")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            project_id,
            project_alias,
            host,
            port,
            debug_port,
            max_workers_per_key,
            max_concurrency,
            backends_path,
            socket_dir,
            quiet,
            companions: CompanionEmulators::from_env(),
        })
    }

    /// Sequential when a debugger is attached, parallel otherwise.
    pub fn execution_mode(&self) -> ExecutionMode {
        if self.debug_port.is_some() {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Auto
        }
    }
}

fn parse_count(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidNumber(var)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A numeric variable could not be parsed.
    #[error("Invalid number in {0}")]
    InvalidNumber(&'static str),
}
