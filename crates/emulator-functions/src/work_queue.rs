// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work queue - admission control for function invocations.
//!
//! Every invocation is submitted as a task. In `Sequential` mode tasks run
//! one at a time in submission order; in `Auto` mode each task is spawned as
//! soon as it is dequeued, optionally bounded by a concurrency cap.
//!
//! A failing or panicking task only affects its own [`TaskHandle`].

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::ExecutionMode;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Errors observed by the submitter of a task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueueError {
    /// The queue is stopped and does not accept tasks.
    #[error("Work queue is stopped")]
    Stopped,

    /// The task panicked while running.
    #[error("Task panicked")]
    TaskPanicked,

    /// The task was dropped without running.
    #[error("Task was dropped before completion")]
    Dropped,
}

/// Completion handle for a submitted task.
pub struct TaskHandle<T>(oneshot::Receiver<Result<T, QueueError>>);

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(QueueError::Dropped)))
    }
}

/// Queue of invocation tasks.
pub struct WorkQueue {
    mode: ExecutionMode,
    max_concurrency: usize,
    tx: mpsc::UnboundedSender<Job>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    accepting: AtomicBool,
    pending: Arc<watch::Sender<usize>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Arc<Notify>>,
}

impl WorkQueue {
    pub fn new(mode: ExecutionMode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0);
        Self {
            mode,
            max_concurrency: 0,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            accepting: AtomicBool::new(true),
            pending: Arc::new(pending),
            consumer: Mutex::new(None),
            shutdown: Mutex::new(Arc::new(Notify::new())),
        }
    }

    /// Cap concurrently running tasks in `Auto` mode. Zero means unlimited.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Tasks submitted and not yet finished.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start consuming tasks. Tasks submitted before this call run now.
    pub fn start(&self) {
        let mut consumer = self.consumer.lock();
        if consumer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.accepting.store(true, Ordering::SeqCst);
        let shutdown = Arc::new(Notify::new());
        *self.shutdown.lock() = shutdown.clone();

        let semaphore = match (self.mode, self.max_concurrency) {
            (ExecutionMode::Auto, n) if n > 0 => Some(Arc::new(Semaphore::new(n))),
            _ => None,
        };
        info!(mode = self.mode.as_str(), max_concurrency = self.max_concurrency, "Work queue started");
        *consumer = Some(tokio::spawn(consume(
            self.rx.clone(),
            self.mode,
            semaphore,
            shutdown,
        )));
    }

    /// Enqueue a task. Its result, panic, or rejection is delivered through
    /// the returned handle; submission itself never blocks.
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        if !self.accepting.load(Ordering::SeqCst) {
            let _ = result_tx.send(Err(QueueError::Stopped));
            return TaskHandle(result_rx);
        }

        self.pending.send_modify(|n| *n += 1);
        let pending = self.pending.clone();
        let job: Job = Box::pin(async move {
            let result = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|_| QueueError::TaskPanicked);
            if result.is_err() {
                warn!("Work queue task panicked");
            }
            let _ = result_tx.send(result);
            pending.send_modify(|n| *n = n.saturating_sub(1));
        });

        if self.tx.send(job).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
        TaskHandle(result_rx)
    }

    /// Resolve once every submitted task has finished. Immediate when empty.
    pub async fn flush(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting tasks. Tasks already queued still run; new submissions
    /// are rejected with [`QueueError::Stopped`] until [`start`](Self::start).
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.lock().notify_one();
        info!("Work queue stopped");
    }
}

async fn consume(
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    mode: ExecutionMode,
    semaphore: Option<Arc<Semaphore>>,
    shutdown: Arc<Notify>,
) {
    let mut rx = rx.lock().await;

    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        run(job, mode, semaphore.as_ref()).await;
    }

    while let Ok(job) = rx.try_recv() {
        run(job, mode, semaphore.as_ref()).await;
    }
    debug!("Work queue consumer exited");
}

async fn run(job: Job, mode: ExecutionMode, semaphore: Option<&Arc<Semaphore>>) {
    match (mode, semaphore) {
        (ExecutionMode::Sequential, _) => job.await,
        (ExecutionMode::Auto, Some(semaphore)) => match semaphore.clone().acquire_owned().await {
            Ok(permit) => {
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });
            }
            Err(_) => {
                tokio::spawn(job);
            }
        },
        (ExecutionMode::Auto, None) => {
            tokio::spawn(job);
        }
    }
}
