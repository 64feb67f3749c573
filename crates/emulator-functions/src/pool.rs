// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime worker pool.
//!
//! Workers are grouped under a key. In `Sequential` mode every function
//! shares one key, so a single runtime serves everything. In `Auto` mode each
//! trigger gets its own group, and requests without a trigger use a
//! diagnostic group.
//!
//! FINISHED workers are evicted on every lookup. A pool-wide [`Notify`] fires
//! on any worker state change, which lets callers wait for a worker to free
//! up when a group is at capacity.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, warn};

use emulator_protocol::DebugBundle;

use crate::logging::{ExtensionLogInfo, FunctionLogger};
use crate::process::RuntimeInstance;
use crate::worker::{ProxiedResponse, ProxyRequest, RuntimeWorker, WorkerError, WorkerState};

/// Group key shared by every function in sequential mode.
pub const SHARED_KEY: &str = "~shared~";

/// Group key for runtimes started without a trigger.
pub const DIAGNOSTIC_KEY: &str = "~diagnostic~";

/// How work is scheduled across runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// One runtime per trigger, requests run in parallel.
    #[default]
    Auto,
    /// One shared runtime, one request at a time.
    Sequential,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Auto => "AUTO",
            ExecutionMode::Sequential => "SEQUENTIAL",
        }
    }
}

/// Errors from pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// `submit_request` was called with no idle worker for the key.
    #[error("No idle worker available for key {0}")]
    NoIdleWorker(String),

    /// The selected worker failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// A reserved slot for a runtime that is being started.
///
/// Counts toward the group's capacity until dropped. Dropping it wakes
/// callers waiting for capacity, whether or not the start succeeded.
pub struct StartPermit {
    pool_starting: Arc<Mutex<HashMap<String, usize>>>,
    changed: Arc<Notify>,
    key: String,
}

impl Drop for StartPermit {
    fn drop(&mut self) {
        {
            let mut starting = self.pool_starting.lock();
            if let Some(count) = starting.get_mut(&self.key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    starting.remove(&self.key);
                }
            }
        }
        self.changed.notify_waiters();
    }
}

/// Groups runtime workers by key and hands out idle ones.
pub struct RuntimeWorkerPool {
    mode: ExecutionMode,
    max_workers_per_key: usize,
    workers: Mutex<HashMap<String, Vec<Arc<RuntimeWorker>>>>,
    starting: Arc<Mutex<HashMap<String, usize>>>,
    changed: Arc<Notify>,
    warned: Arc<Mutex<HashSet<String>>>,
}

impl RuntimeWorkerPool {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            max_workers_per_key: 0,
            workers: Mutex::new(HashMap::new()),
            starting: Arc::new(Mutex::new(HashMap::new())),
            changed: Arc::new(Notify::new()),
            warned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Cap the number of live workers per key. Zero means unlimited.
    pub fn with_max_workers_per_key(mut self, max: usize) -> Self {
        self.max_workers_per_key = max;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Group key for a trigger.
    pub fn key(&self, trigger_id: Option<&str>) -> String {
        match (self.mode, trigger_id) {
            (ExecutionMode::Sequential, _) => SHARED_KEY.to_string(),
            (ExecutionMode::Auto, Some(id)) => id.to_string(),
            (ExecutionMode::Auto, None) => DIAGNOSTIC_KEY.to_string(),
        }
    }

    /// Whether an IDLE worker exists for the trigger.
    pub fn ready_for_work(&self, trigger_id: Option<&str>) -> bool {
        self.get_idle_worker(trigger_id).is_some()
    }

    /// First IDLE worker for the trigger, without claiming it.
    ///
    /// Evicts FINISHED workers and registers an empty group for an unseen
    /// key. Calling it repeatedly without a dispatch in between returns the
    /// same worker.
    pub fn get_idle_worker(&self, trigger_id: Option<&str>) -> Option<Arc<RuntimeWorker>> {
        let key = self.key(trigger_id);
        let mut workers = self.workers.lock();
        Self::cleanup(&mut workers);

        let group = workers.entry(key).or_default();
        group
            .iter()
            .find(|worker| worker.state() == WorkerState::Idle)
            .cloned()
    }

    /// Find an IDLE worker and move it to BUSY in one step.
    pub fn claim_idle_worker(&self, trigger_id: Option<&str>) -> Option<Arc<RuntimeWorker>> {
        let key = self.key(trigger_id);
        let mut workers = self.workers.lock();
        Self::cleanup(&mut workers);

        workers
            .entry(key)
            .or_default()
            .iter()
            .find(|worker| worker.claim())
            .cloned()
    }

    /// Wrap a new runtime in a worker and add it to the trigger's group.
    ///
    /// The worker's logs are forwarded to a per-function logger, or to the
    /// emulator logger when there is no trigger.
    pub fn add_worker(
        &self,
        trigger_id: Option<&str>,
        instance: RuntimeInstance,
        extension: ExtensionLogInfo,
    ) -> Arc<RuntimeWorker> {
        self.insert_worker(trigger_id, instance, extension, false)
    }

    /// Like [`add_worker`](Self::add_worker), but the worker is BUSY before
    /// any other caller can see it.
    pub fn add_reserved_worker(
        &self,
        trigger_id: Option<&str>,
        instance: RuntimeInstance,
        extension: ExtensionLogInfo,
    ) -> Arc<RuntimeWorker> {
        self.insert_worker(trigger_id, instance, extension, true)
    }

    fn insert_worker(
        &self,
        trigger_id: Option<&str>,
        instance: RuntimeInstance,
        extension: ExtensionLogInfo,
        reserved: bool,
    ) -> Arc<RuntimeWorker> {
        let key = self.key(trigger_id);
        let worker = RuntimeWorker::new(key.clone(), instance, self.changed.clone());

        let logger = match trigger_id {
            Some(id) => FunctionLogger::for_function(id, extension),
            None => FunctionLogger::for_emulator(),
        }
        .with_warned(self.warned.clone());
        if let Some(logs) = worker.subscribe_logs() {
            tokio::spawn(forward_logs(logs, logger));
        }

        {
            let mut workers = self.workers.lock();
            if reserved {
                worker.claim();
            }
            workers.entry(key.clone()).or_default().push(worker.clone());
        }

        debug!(key = %key, worker = %worker.id(), "Added runtime worker");
        self.changed.notify_waiters();
        worker
    }

    /// Reserve a start slot if the group is below capacity.
    pub fn try_begin_start(&self, trigger_id: Option<&str>) -> Option<StartPermit> {
        let key = self.key(trigger_id);
        let mut workers = self.workers.lock();
        Self::cleanup(&mut workers);
        let live = workers.get(&key).map(Vec::len).unwrap_or(0);

        let mut starting = self.starting.lock();
        let pending = starting.get(&key).copied().unwrap_or(0);
        if self.max_workers_per_key != 0 && live + pending >= self.max_workers_per_key {
            return None;
        }
        *starting.entry(key.clone()).or_insert(0) += 1;
        Some(StartPermit {
            pool_starting: self.starting.clone(),
            changed: self.changed.clone(),
            key,
        })
    }

    /// Forward a request to an IDLE worker.
    ///
    /// Callers must check [`ready_for_work`](Self::ready_for_work) first;
    /// without an idle worker this fails immediately.
    pub async fn submit_request(
        &self,
        trigger_id: Option<&str>,
        request: ProxyRequest,
        debug: Option<DebugBundle>,
    ) -> Result<ProxiedResponse, PoolError> {
        let worker = self
            .claim_idle_worker(trigger_id)
            .ok_or_else(|| PoolError::NoIdleWorker(self.key(trigger_id)))?;
        self.dispatch_claimed(&worker, request, debug).await
    }

    /// Forward a request to a worker the caller already claimed.
    pub async fn dispatch_claimed(
        &self,
        worker: &Arc<RuntimeWorker>,
        request: ProxyRequest,
        debug: Option<DebugBundle>,
    ) -> Result<ProxiedResponse, PoolError> {
        if let Some(bundle) = debug
            && let Err(e) = worker.send_debug_msg(&bundle).await
        {
            worker.finish_request();
            return Err(e.into());
        }
        Ok(worker.proxy_claimed(request).await)
    }

    /// Retire every worker: IDLE ones die now, BUSY ones after their request.
    pub fn refresh(&self) {
        let workers = self.workers.lock();
        for worker in workers.values().flatten() {
            worker.retire();
        }
    }

    /// Kill every worker regardless of state.
    pub fn exit(&self) {
        let workers = self.workers.lock();
        for worker in workers.values().flatten() {
            worker.kill();
        }
    }

    /// Live workers for the trigger's key.
    pub fn workers_for(&self, trigger_id: Option<&str>) -> Vec<Arc<RuntimeWorker>> {
        let key = self.key(trigger_id);
        self.workers.lock().get(&key).cloned().unwrap_or_default()
    }

    /// Keys with a registered group, including empty ones.
    pub fn keys(&self) -> Vec<String> {
        self.workers.lock().keys().cloned().collect()
    }

    /// Total number of workers across all keys.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().values().map(Vec::len).sum()
    }

    /// Notified on every worker state change.
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    fn cleanup(workers: &mut HashMap<String, Vec<Arc<RuntimeWorker>>>) {
        for (key, group) in workers.iter_mut() {
            let before = group.len();
            group.retain(|worker| worker.state() != WorkerState::Finished);
            if group.len() != before {
                debug!(key = %key, evicted = before - group.len(), "Evicted finished workers");
            }
        }
    }
}

async fn forward_logs(mut logs: broadcast::Receiver<emulator_protocol::RuntimeLog>, logger: FunctionLogger) {
    loop {
        match logs.recv().await {
            Ok(log) => {
                logger.handle_runtime_log(&log);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    function = logger.function().unwrap_or("emulator"),
                    skipped, "Runtime log forwarding fell behind"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_sequential_is_shared() {
        let pool = RuntimeWorkerPool::new(ExecutionMode::Sequential);
        assert_eq!(pool.key(Some("us-central1-a")), SHARED_KEY);
        assert_eq!(pool.key(Some("us-central1-b")), SHARED_KEY);
        assert_eq!(pool.key(None), SHARED_KEY);
    }

    #[test]
    fn test_key_auto_per_trigger() {
        let pool = RuntimeWorkerPool::new(ExecutionMode::Auto);
        assert_eq!(pool.key(Some("us-central1-a")), "us-central1-a");
        assert_eq!(pool.key(None), DIAGNOSTIC_KEY);
    }

    #[test]
    fn test_empty_group_registered_on_lookup() {
        let pool = RuntimeWorkerPool::new(ExecutionMode::Auto);
        assert!(pool.get_idle_worker(Some("fn")).is_none());
        assert_eq!(pool.keys(), vec!["fn".to_string()]);
        assert!(!pool.ready_for_work(Some("fn")));
    }

    #[test]
    fn test_start_permits_respect_capacity() {
        let pool = RuntimeWorkerPool::new(ExecutionMode::Auto).with_max_workers_per_key(2);
        let first = pool.try_begin_start(Some("fn"));
        let second = pool.try_begin_start(Some("fn"));
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(pool.try_begin_start(Some("fn")).is_none());
        assert!(pool.try_begin_start(Some("other")).is_some());

        drop(first);
        assert!(pool.try_begin_start(Some("fn")).is_some());
    }

    #[tokio::test]
    async fn test_dropped_permit_wakes_waiters() {
        let pool = RuntimeWorkerPool::new(ExecutionMode::Auto).with_max_workers_per_key(1);
        let permit = pool.try_begin_start(Some("fn")).unwrap();

        let changed = pool.changed();
        let notified = changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        drop(permit);
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .unwrap();
        assert!(pool.try_begin_start(Some("fn")).is_some());
    }

    #[test]
    fn test_unlimited_capacity() {
        let pool = RuntimeWorkerPool::new(ExecutionMode::Auto);
        let permits: Vec<_> = (0..32).filter_map(|_| pool.try_begin_start(Some("fn"))).collect();
        assert_eq!(permits.len(), 32);
    }
}
