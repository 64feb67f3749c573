// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for emulator-functions.

use thiserror::Error;

/// Emulator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Launching or controlling a runtime process failed.
    #[error("Process error: {0}")]
    Process(#[from] crate::process::ProcessError),

    /// A runtime worker failed.
    #[error("Worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),

    /// The worker pool rejected a request.
    #[error("Pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),

    /// The work queue rejected or lost a task.
    #[error("Queue error: {0}")]
    Queue(#[from] crate::work_queue::QueueError),

    /// Outbound HTTP call to a companion emulator failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Source watching failed.
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Loading an env file failed.
    #[error("Env file error: {0}")]
    EnvFile(#[from] dotenvy::Error),

    /// Trigger discovery failed.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// A backend declaration is invalid.
    #[error("Invalid backend: {0}")]
    InvalidBackend(String),

    /// A discovered function has an id the platform would reject.
    #[error("functions[{0}]: Invalid function id")]
    InvalidFunctionId(String),

    /// A multicast event could not be parsed.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// A trigger resource could not be parsed.
    #[error("Malformed trigger resource: {0}")]
    MalformedResource(String),

    /// A companion emulator rejected a registration.
    #[error("Registration with {service} failed: {message}")]
    Registration {
        /// Service that rejected the registration.
        service: &'static str,
        /// Response or transport error.
        message: String,
    },

    /// No trigger is registered under the key.
    #[error("Function {0} does not exist")]
    TriggerNotFound(String),

    /// No codebase with this name is being served.
    #[error("Unknown codebase: {0}")]
    UnknownCodebase(String),

    /// The emulator is not in a state that allows the operation.
    #[error("Emulator not running: {0}")]
    NotRunning(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using emulator Error.
pub type Result<T> = std::result::Result<T, Error>;
