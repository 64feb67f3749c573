// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime worker - one runtime process and its request lifecycle.
//!
//! A worker proxies at most one request at a time to its runtime over a
//! Unix socket and tracks where it is in its life:
//!
//! ```text
//!              request()             response body done
//!   IDLE ───────────────────▶ BUSY ───────────────────▶ IDLE
//!     │                         │
//!     │ retire()                │ retire()
//!     ▼                         ▼
//!   FINISHING ◀──────────── FINISHING ── body done ──▶ kill
//!     │
//!     │ process exit (any state)
//!     ▼
//!   FINISHED
//! ```
//!
//! FINISHED is terminal and is only entered when the process has exited.
//! A FINISHING worker never goes back to IDLE or BUSY.

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use emulator_protocol::{DebugBundle, HEALTH_CHECK_PATH, LineBuffer, RuntimeLog, encode_message};
use http_body_util::{Empty, Full};
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::process::{
    OutputChunk, ProcessControl, ProcessError, ProcessExit, RuntimeInstance,
};

/// How long a runtime gets to start serving on its socket.
pub const SOCKET_READY_TIMEOUT: Duration = Duration::from_secs(30);

const SOCKET_READY_BACKOFF: Duration = Duration::from_millis(100);
const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Ready for a request.
    Idle,
    /// Serving a request.
    Busy,
    /// Retiring; accepts no new requests.
    Finishing,
    /// Process has exited.
    Finished,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "IDLE",
            WorkerState::Busy => "BUSY",
            WorkerState::Finishing => "FINISHING",
            WorkerState::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from worker operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The worker was not IDLE when a request was offered.
    #[error("Worker {id} cannot accept requests in state {state}")]
    NotAccepting {
        /// Worker id
        id: String,
        /// State at the time of the request
        state: WorkerState,
    },

    /// The runtime did not start serving in time.
    #[error("Failed to load function: runtime socket not ready after {0:?}")]
    SocketTimeout(Duration),

    /// The runtime exited before its socket became ready.
    #[error("Failed to load function: runtime exited during startup")]
    ExitedDuringStartup,

    /// The health check failed with a non-retryable error.
    #[error("Health check failed: {0}")]
    HealthCheck(String),

    /// Writing to the control channel failed.
    #[error("Control channel error: {0}")]
    Control(#[from] ProcessError),

    /// Encoding a control message failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] emulator_protocol::FrameError),
}

/// A request forwarded verbatim to a runtime.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query as seen by the runtime
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A JSON POST to `/`, the shape used for direct background invocations.
    pub fn json(body: &serde_json::Value) -> Self {
        let mut request = Self::new(Method::POST, "/");
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.body = Bytes::from(body.to_string());
        request
    }
}

/// Resolves once a proxied response has finished streaming or was dropped.
#[derive(Debug)]
pub struct RequestCompletion(oneshot::Receiver<()>);

impl Future for RequestCompletion {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

/// A runtime response plus a handle on its completion.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub response: Response<Body>,
    pub completion: RequestCompletion,
}

/// One runtime process plus its request lifecycle.
pub struct RuntimeWorker {
    id: String,
    key: String,
    socket_path: PathBuf,
    cwd: PathBuf,
    pid: Option<u32>,
    control: Arc<dyn ProcessControl>,
    state: Mutex<WorkerState>,
    state_tx: watch::Sender<WorkerState>,
    logs: Mutex<Option<broadcast::Sender<RuntimeLog>>>,
    changed: Arc<Notify>,
}

impl fmt::Debug for RuntimeWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeWorker")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl RuntimeWorker {
    /// Wrap a freshly spawned runtime. The worker starts IDLE.
    ///
    /// `changed` is notified on every state transition.
    pub fn new(key: impl Into<String>, instance: RuntimeInstance, changed: Arc<Notify>) -> Arc<Self> {
        let RuntimeInstance {
            process,
            socket_path,
            cwd,
        } = instance;
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);

        let worker = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            key: key.into(),
            socket_path,
            cwd,
            pid: process.pid,
            control: process.control,
            state: Mutex::new(WorkerState::Idle),
            state_tx,
            logs: Mutex::new(Some(log_tx)),
            changed,
        });

        tokio::spawn(watch_process(worker.clone(), process.output, process.exit));
        worker
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Subscribe to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Wait until the worker reaches `target`.
    pub async fn wait_for_state(&self, target: WorkerState) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Subscribe to runtime logs. `None` once the process has exited; the
    /// stream closes when it does.
    pub fn subscribe_logs(&self) -> Option<broadcast::Receiver<RuntimeLog>> {
        self.logs.lock().as_ref().map(|tx| tx.subscribe())
    }

    fn transition(&self, current: &mut WorkerState, next: WorkerState) {
        if *current == WorkerState::Finished || *current == next {
            return;
        }
        debug!("[worker-{}-{}]: {}", self.key, self.id, next);
        *current = next;
        self.state_tx.send_replace(next);
        self.changed.notify_waiters();
    }

    /// Atomically move IDLE to BUSY. Returns false in any other state.
    pub(crate) fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if *state != WorkerState::Idle {
            return false;
        }
        self.transition(&mut state, WorkerState::Busy);
        true
    }

    /// End the current request: BUSY goes back to IDLE, FINISHING is killed.
    pub(crate) fn finish_request(&self) {
        let mut state = self.state.lock();
        match *state {
            WorkerState::Busy => self.transition(&mut state, WorkerState::Idle),
            WorkerState::Finishing => {
                drop(state);
                self.kill();
            }
            _ => {}
        }
    }

    /// Stop accepting requests. An IDLE worker is killed right away; a BUSY
    /// one is killed once its request completes.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        match *state {
            WorkerState::Idle => {
                self.transition(&mut state, WorkerState::Finishing);
                drop(state);
                self.kill();
            }
            WorkerState::Busy => self.transition(&mut state, WorkerState::Finishing),
            _ => {}
        }
    }

    /// Ask the process to terminate. FINISHED follows once it has exited.
    pub fn kill(&self) {
        debug!(worker = %self.id, key = %self.key, "Killing runtime");
        self.control.kill();
    }

    /// Proxy a request to the runtime.
    ///
    /// Fails without side effects unless the worker is IDLE. Transport
    /// failures do not surface as errors: the runtime is killed and the
    /// caller receives a 500 response with an error payload.
    pub async fn request(self: &Arc<Self>, request: ProxyRequest) -> Result<ProxiedResponse, WorkerError> {
        if !self.claim() {
            return Err(WorkerError::NotAccepting {
                id: self.id.clone(),
                state: self.state(),
            });
        }
        Ok(self.proxy_claimed(request).await)
    }

    /// Proxy a request on a worker already moved to BUSY by [`claim`](Self::claim).
    pub(crate) async fn proxy_claimed(self: &Arc<Self>, request: ProxyRequest) -> ProxiedResponse {
        let (done_tx, done_rx) = oneshot::channel();
        let guard = BusyGuard {
            worker: self.clone(),
            done: Some(done_tx),
        };

        match self.send_over_socket(request).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let body = CompletionBody {
                    inner: Box::pin(body),
                    guard: Some(guard),
                };
                ProxiedResponse {
                    response: Response::from_parts(parts, Body::new(body)),
                    completion: RequestCompletion(done_rx),
                }
            }
            Err(message) => {
                warn!(worker = %self.id, key = %self.key, error = %message, "Request to runtime failed");
                {
                    let mut state = self.state.lock();
                    self.transition(&mut state, WorkerState::Finishing);
                }
                drop(guard);
                ProxiedResponse {
                    response: transport_error_response(&message),
                    completion: RequestCompletion(done_rx),
                }
            }
        }
    }

    async fn send_over_socket(&self, request: ProxyRequest) -> Result<Response<Incoming>, String> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| e.to_string())?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| e.to_string())?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Runtime connection closed with error");
            }
        });

        let mut headers = request.headers;
        headers.remove(TRANSFER_ENCODING);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(request.body.len()));

        let mut outbound = Request::builder()
            .method(request.method)
            .uri(request.path)
            .body(Full::new(request.body))
            .map_err(|e| e.to_string())?;
        *outbound.headers_mut() = headers;

        sender.send_request(outbound).await.map_err(|e| e.to_string())
    }

    /// Write a debug bundle to the control channel.
    pub async fn send_debug_msg(&self, bundle: &DebugBundle) -> Result<(), WorkerError> {
        let line = encode_message(bundle)?;
        self.control.send(&line).await?;
        Ok(())
    }

    /// Wait until the runtime answers its health check.
    pub async fn wait_for_socket_ready(&self) -> Result<(), WorkerError> {
        self.wait_for_socket_ready_within(SOCKET_READY_TIMEOUT).await
    }

    /// Like [`wait_for_socket_ready`](Self::wait_for_socket_ready) with a custom limit.
    ///
    /// Connection refused and missing socket are retried every 100 ms; any
    /// other failure ends the wait immediately.
    pub async fn wait_for_socket_ready_within(&self, limit: Duration) -> Result<(), WorkerError> {
        let poll = async {
            loop {
                if self.state() == WorkerState::Finished {
                    return Err(WorkerError::ExitedDuringStartup);
                }
                match self.check_health().await {
                    Ok(()) => return Ok(()),
                    Err(HealthCheckError::Connect(e)) if is_retryable(&e) => {
                        tokio::time::sleep(SOCKET_READY_BACKOFF).await;
                    }
                    Err(e) => return Err(WorkerError::HealthCheck(e.to_string())),
                }
            }
        };

        tokio::time::timeout(limit, poll)
            .await
            .map_err(|_| WorkerError::SocketTimeout(limit))?
    }

    async fn check_health(&self) -> Result<(), HealthCheckError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(HealthCheckError::Connect)?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(HealthCheckError::Http)?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(HEALTH_CHECK_PATH)
            .body(Empty::<Bytes>::new())
            .map_err(|e| HealthCheckError::Other(e.to_string()))?;
        sender.send_request(request).await.map_err(HealthCheckError::Http)?;
        Ok(())
    }

    fn publish(&self, log: RuntimeLog) {
        if let Some(tx) = self.logs.lock().as_ref() {
            let _ = tx.send(log);
        }
    }

    fn handle_line(&self, line: &str) {
        let log = RuntimeLog::from_line(line);
        let fatal = log.is_fatal();
        self.publish(log);
        if fatal {
            self.publish(RuntimeLog::killed());
            self.kill();
        }
    }

    fn mark_exited(&self, exit: Option<ProcessExit>) {
        debug!(
            worker = %self.id,
            key = %self.key,
            code = ?exit.and_then(|e| e.code),
            "Runtime exited"
        );
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(worker = %self.id, error = %e, "Failed to remove runtime socket");
        }
        {
            let mut state = self.state.lock();
            self.transition(&mut state, WorkerState::Finished);
        }
        self.logs.lock().take();
    }
}

/// Reads runtime output until the process exits, then marks the worker FINISHED.
async fn watch_process(
    worker: Arc<RuntimeWorker>,
    mut output: mpsc::UnboundedReceiver<OutputChunk>,
    mut exit: watch::Receiver<Option<ProcessExit>>,
) {
    let mut stdio = LineBuffer::new();
    let mut control = LineBuffer::new();

    let status = loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => handle_chunk(&worker, chunk, &mut stdio, &mut control),
                None => break wait_for_exit(&mut exit).await,
            },
            status = wait_for_exit(&mut exit) => {
                while let Ok(chunk) = output.try_recv() {
                    handle_chunk(&worker, chunk, &mut stdio, &mut control);
                }
                break status;
            }
        }
    };

    for line in [stdio.flush(), control.flush()].into_iter().flatten() {
        worker.handle_line(&line);
    }
    worker.mark_exited(status);
}

fn handle_chunk(
    worker: &RuntimeWorker,
    chunk: OutputChunk,
    stdio: &mut LineBuffer,
    control: &mut LineBuffer,
) {
    let lines = match chunk {
        OutputChunk::Stdout(bytes) | OutputChunk::Stderr(bytes) => stdio.push(&bytes),
        OutputChunk::Control(bytes) => control.push(&bytes),
    };
    for line in lines {
        worker.handle_line(&line);
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    loop {
        if let Some(status) = *exit.borrow_and_update() {
            return Some(status);
        }
        if exit.changed().await.is_err() {
            return *exit.borrow();
        }
    }
}

/// Ends the request on drop, whether the body completed or was abandoned.
struct BusyGuard {
    worker: Arc<RuntimeWorker>,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.worker.finish_request();
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Response body that releases its worker once fully streamed.
struct CompletionBody {
    inner: Pin<Box<Incoming>>,
    guard: Option<BusyGuard>,
}

impl HttpBody for CompletionBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = this.inner.as_mut().poll_frame(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.guard.take();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[derive(Debug, Error)]
enum HealthCheckError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("HTTP error: {0}")]
    Http(hyper::Error),
    #[error("{0}")]
    Other(String),
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
    )
}

fn transport_error_response(message: &str) -> Response<Body> {
    let payload = serde_json::json!({ "error": message });
    let mut response = Response::new(Body::from(payload.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Idle.to_string(), "IDLE");
        assert_eq!(WorkerState::Busy.to_string(), "BUSY");
        assert_eq!(WorkerState::Finishing.to_string(), "FINISHING");
        assert_eq!(WorkerState::Finished.to_string(), "FINISHED");
    }

    #[test]
    fn test_retryable_errors() {
        use std::io::{Error, ErrorKind};
        assert!(is_retryable(&Error::from(ErrorKind::ConnectionRefused)));
        assert!(is_retryable(&Error::from(ErrorKind::NotFound)));
        assert!(!is_retryable(&Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_retryable(&Error::from(ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_json_proxy_request() {
        let request = ProxyRequest::json(&serde_json::json!({"data": 1}));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, "/");
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(&request.body[..], br#"{"data":1}"#);
    }

    #[tokio::test]
    async fn test_transport_error_payload() {
        let response = transport_error_response("connection reset");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "connection reset");
    }
}
