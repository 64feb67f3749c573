// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process spawner.
//!
//! Runs the runtime as a child process. Stdin is the control channel,
//! stdout and stderr are forwarded as output chunks. Termination sends
//! SIGINT and escalates to SIGKILL after a grace period.

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{debug, warn};

use super::traits::*;

/// Time a runtime gets to exit after SIGINT before it is killed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(4000);

const READ_BUFFER_SIZE: usize = 8192;

/// Spawner that launches runtimes as local child processes.
pub struct NativeSpawner {
    kill_grace: Duration,
}

impl Default for NativeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeSpawner {
    pub fn new() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

struct NativeControl {
    stdin: Mutex<Option<ChildStdin>>,
    kill: Arc<Notify>,
}

#[async_trait]
impl ProcessControl for NativeControl {
    async fn send(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::ControlClosed)?;

        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');

        if let Err(e) = async {
            stdin.write_all(&payload).await?;
            stdin.flush().await
        }
        .await
        {
            guard.take();
            return Err(e.into());
        }
        Ok(())
    }

    fn kill(&self) {
        self.kill.notify_one();
    }
}

#[async_trait]
impl ProcessSpawner for NativeSpawner {
    fn spawner_type(&self) -> &'static str {
        "native"
    }

    async fn spawn(&self, options: &SpawnOptions) -> Result<RuntimeProcess> {
        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args)
            .current_dir(&options.cwd)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::BinaryNotFound(options.program.display().to_string())
            } else {
                ProcessError::SpawnFailed(e.to_string())
            }
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        debug!(?pid, program = %options.program.display(), "Runtime process spawned");

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, output_tx.clone(), OutputChunk::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, output_tx, OutputChunk::Stderr));
        }

        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(supervise(child, pid, kill.clone(), exit_tx, self.kill_grace));

        Ok(RuntimeProcess {
            pid,
            output: output_rx,
            control: Arc::new(NativeControl {
                stdin: Mutex::new(stdin),
                kill,
            }),
            exit: exit_rx,
        })
    }
}

async fn pump<R, F>(mut reader: R, tx: mpsc::UnboundedSender<OutputChunk>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(Bytes) -> OutputChunk,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Runtime output stream read failed");
                break;
            }
        }
    }
}

/// Wait for the child to exit, handling kill requests on the way.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill: Arc<Notify>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.notified() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Some(pid) = pid
                && let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT)
            {
                debug!(pid, error = %e, "SIGINT delivery failed");
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(?pid, "Unable to terminate runtime gracefully, sending SIGKILL");
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "SIGKILL delivery failed");
                    }
                    child.wait().await
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(?pid, error = %e, "Failed to collect runtime exit status");
            None
        }
    };
    debug!(?pid, ?code, "Runtime process exited");
    let _ = exit_tx.send(Some(ProcessExit { code }));
}
