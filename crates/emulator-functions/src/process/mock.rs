// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock spawner for testing.
//!
//! Instead of launching a process, each spawn serves an axum router on the
//! requested Unix socket, the same way a real runtime would. Control
//! messages are recorded and output lines can be injected at any time.

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{Notify, mpsc, watch};
use tracing::debug;

use super::traits::*;

/// Builds the router a mock runtime serves.
pub type RouterFactory = Arc<dyn Fn(&SpawnOptions) -> Router + Send + Sync>;

/// Everything observable about one mock runtime.
#[derive(Clone)]
pub struct MockProcessRecord {
    pub options: SpawnOptions,
    control_messages: Arc<parking_lot::Mutex<Vec<String>>>,
    output: mpsc::UnboundedSender<OutputChunk>,
    killed: Arc<AtomicBool>,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl MockProcessRecord {
    /// Lines received on the control channel.
    pub fn control_messages(&self) -> Vec<String> {
        self.control_messages.lock().clone()
    }

    /// Write a line to the runtime's stdout.
    pub fn emit_stdout(&self, line: &str) {
        let _ = self
            .output
            .send(OutputChunk::Stdout(Bytes::from(format!("{line}\n"))));
    }

    /// Write raw bytes to the runtime's control channel.
    pub fn emit_control(&self, bytes: &[u8]) {
        let _ = self
            .output
            .send(OutputChunk::Control(Bytes::copy_from_slice(bytes)));
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Terminate the runtime as if it crashed.
    pub fn crash(&self) {
        self.kill.notify_one();
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

struct MockControl {
    messages: Arc<parking_lot::Mutex<Vec<String>>>,
    killed: Arc<AtomicBool>,
    kill: Arc<Notify>,
}

#[async_trait]
impl ProcessControl for MockControl {
    async fn send(&self, line: &str) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(ProcessError::ControlClosed);
        }
        self.messages.lock().push(line.to_string());
        Ok(())
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill.notify_one();
    }
}

/// Mock spawner for testing.
pub struct MockSpawner {
    factory: RouterFactory,
    processes: parking_lot::Mutex<Vec<MockProcessRecord>>,
    /// Delay before the socket starts listening
    pub startup_delay: Duration,
    /// If true, the socket never starts listening
    pub never_ready: bool,
    /// Lines written to stdout once the socket is listening
    pub startup_logs: Vec<String>,
    /// If true, every spawn fails
    pub fail_spawn: bool,
}

impl MockSpawner {
    /// Create a mock spawner whose runtimes all serve `router`.
    pub fn new(router: Router) -> Self {
        Self::with_factory(move |_| router.clone())
    }

    /// Create a mock spawner that builds a router per spawned runtime.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&SpawnOptions) -> Router + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            processes: parking_lot::Mutex::new(Vec::new()),
            startup_delay: Duration::ZERO,
            never_ready: false,
            startup_logs: Vec::new(),
            fail_spawn: false,
        }
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    pub fn with_startup_logs(mut self, lines: Vec<String>) -> Self {
        self.startup_logs = lines;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    /// Number of runtimes spawned so far.
    pub fn spawn_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Records of every spawned runtime, oldest first.
    pub fn processes(&self) -> Vec<MockProcessRecord> {
        self.processes.lock().clone()
    }
}

#[async_trait]
impl ProcessSpawner for MockSpawner {
    fn spawner_type(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, options: &SpawnOptions) -> Result<RuntimeProcess> {
        if self.fail_spawn {
            return Err(ProcessError::SpawnFailed("mock spawn failure".to_string()));
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let killed = Arc::new(AtomicBool::new(false));
        let messages = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let record = MockProcessRecord {
            options: options.clone(),
            control_messages: messages.clone(),
            output: output_tx.clone(),
            killed: killed.clone(),
            kill: kill.clone(),
            exit: exit_rx.clone(),
        };
        self.processes.lock().push(record.clone());

        let router = (self.factory)(options);
        let socket_path = options.socket_path.clone();
        let delay = self.startup_delay;
        let never_ready = self.never_ready;
        let startup_logs = self.startup_logs.clone();
        let shutdown = kill.clone();

        tokio::spawn(async move {
            let serve = async {
                tokio::time::sleep(delay).await;
                if never_ready {
                    return std::future::pending::<()>().await;
                }
                let listener = match UnixListener::bind(&socket_path) {
                    Ok(listener) => listener,
                    Err(e) => {
                        debug!(error = %e, "Mock runtime failed to bind socket");
                        return;
                    }
                };
                for line in &startup_logs {
                    record.emit_stdout(line);
                }
                if let Err(e) = axum::serve(listener, router).await {
                    debug!(error = %e, "Mock runtime server stopped");
                }
            };

            tokio::select! {
                _ = serve => {}
                _ = shutdown.notified() => {}
            }

            // Like a killed runtime, the socket file stays behind.
            let _ = exit_tx.send(Some(ProcessExit { code: None }));
        });

        Ok(RuntimeProcess {
            pid: None,
            output: output_rx,
            control: Arc::new(MockControl {
                messages,
                killed,
                kill,
            }),
            exit: exit_rx,
        })
    }
}
