// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process spawner trait definitions.
//!
//! Defines the abstract interface for launching runtime processes.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors from process operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// Runtime executable was not found.
    #[error("Runtime binary not found: {0}")]
    BinaryNotFound(String),

    /// Process failed to start.
    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    /// The control channel is no longer writable.
    #[error("Control channel closed")]
    ControlClosed,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for process operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Options for launching a runtime process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments, including any debugger flags
    pub args: Vec<String>,
    /// Working directory (the backend's functions directory)
    pub cwd: PathBuf,
    /// Environment applied on top of the inherited environment
    pub env: HashMap<String, String>,
    /// Unix socket the runtime must listen on
    pub socket_path: PathBuf,
}

/// A chunk of output read from one of the runtime's streams.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
    /// Messages written by the runtime on its control channel.
    Control(Bytes),
}

/// How a runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
}

/// Writable side of a running process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Write one line to the control channel. A terminator is appended.
    async fn send(&self, line: &str) -> Result<()>;

    /// Ask the process to terminate. Returns immediately; termination is
    /// observed through [`RuntimeProcess::exit`].
    fn kill(&self);
}

/// A launched runtime process.
pub struct RuntimeProcess {
    /// OS process id, when there is one
    pub pid: Option<u32>,
    /// Output from stdout, stderr and the control channel
    pub output: mpsc::UnboundedReceiver<OutputChunk>,
    /// Control handle
    pub control: Arc<dyn ProcessControl>,
    /// Becomes `Some` once the process has exited
    pub exit: watch::Receiver<Option<ProcessExit>>,
}

/// One OS process plus the socket it serves on and the directory it runs in.
pub struct RuntimeInstance {
    pub process: RuntimeProcess,
    pub socket_path: PathBuf,
    pub cwd: PathBuf,
}

/// Trait for runtime process spawners.
///
/// Spawners only start and stop processes. Request routing and lifecycle
/// tracking are handled by the worker that owns the instance.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawner type identifier (e.g., "native", "mock")
    fn spawner_type(&self) -> &'static str;

    /// Start a runtime process.
    async fn spawn(&self, options: &SpawnOptions) -> Result<RuntimeProcess>;
}
