// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The functions emulator.
//!
//! [`FunctionsEmulator`] owns everything needed to serve functions locally:
//! the trigger registry, one worker pool per codebase, the work queue, the
//! process spawner, source discovery, watchers and the HTTP hub.
//!
//! # Example
//!
//! ```rust,ignore
//! use emulator_functions::{EmulatableBackend, FunctionsEmulator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let emulator = FunctionsEmulator::builder()
//!         .project_id("demo-project")
//!         .backend(EmulatableBackend::new("./functions"))
//!         .port(5001)
//!         .build()?;
//!
//!     emulator.start().await?;
//!     emulator.connect().await?;
//!
//!     // ... serve requests ...
//!
//!     emulator.stop().await?;
//!     Ok(())
//! }
//! ```

use axum::body::Body;
use axum::http::Response;
use emulator_protocol::DebugBundle;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendInfo, EmulatableBackend};
use crate::config::{Companion, CompanionEmulators, Config};
use crate::discovery::{BackendDiscovery, SourceDiscovery};
use crate::env::{EnvContext, runtime_env};
use crate::error::{Error, Result};
use crate::pool::{ExecutionMode, RuntimeWorkerPool};
use crate::process::{NativeSpawner, ProcessSpawner, RuntimeInstance, SpawnOptions};
use crate::registry::{BlockingFunctionsConfig, BlockingTriggers, TriggerRecord, TriggerRegistry};
use crate::server;
use crate::services::{EventService, OWNER_AUTHORIZATION, Registration, RegistrarTable, RegistrationContext};
use crate::trigger::{TriggerDefinition, TriggerKind, is_valid_function_name};
use crate::watcher::{ReloadFn, SourceWatcher};
use crate::work_queue::{QueueError, WorkQueue};
use crate::worker::{ProxiedResponse, ProxyRequest, RuntimeWorker};

/// How long `stop` waits for queued invocations to drain.
pub const STOP_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

const COMPANION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`FunctionsEmulator`].
pub struct FunctionsEmulatorBuilder {
    project_id: Option<String>,
    project_alias: Option<String>,
    host: String,
    port: u16,
    debug_port: Option<u16>,
    max_workers_per_key: usize,
    max_concurrency: usize,
    socket_dir: PathBuf,
    storage_bucket: Option<String>,
    companions: CompanionEmulators,
    backends: Vec<EmulatableBackend>,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    discovery: Option<Arc<dyn SourceDiscovery>>,
    registrars: Option<RegistrarTable>,
    companion_timeout: Duration,
}

impl Default for FunctionsEmulatorBuilder {
    fn default() -> Self {
        Self {
            project_id: None,
            project_alias: None,
            host: "127.0.0.1".to_string(),
            port: 5001,
            debug_port: None,
            max_workers_per_key: 8,
            max_concurrency: 0,
            socket_dir: std::env::temp_dir(),
            storage_bucket: None,
            companions: CompanionEmulators::new(),
            backends: Vec::new(),
            spawner: None,
            discovery: None,
            registrars: None,
            companion_timeout: COMPANION_REQUEST_TIMEOUT,
        }
    }
}

impl FunctionsEmulatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from environment configuration. Backends are added separately.
    pub fn from_config(config: &Config) -> Self {
        Self {
            project_id: Some(config.project_id.clone()),
            project_alias: config.project_alias.clone(),
            host: config.host.clone(),
            port: config.port,
            debug_port: config.debug_port,
            max_workers_per_key: config.max_workers_per_key,
            max_concurrency: config.max_concurrency,
            socket_dir: config.socket_dir.clone(),
            companions: config.companions.clone(),
            ..Self::default()
        }
    }

    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn project_alias(mut self, alias: impl Into<String>) -> Self {
        self.project_alias = Some(alias.into());
        self
    }

    /// Interface the hub binds to (default: 127.0.0.1).
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port the hub binds to (default: 5001). Zero picks a free port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Attach a debugger on this port. Switches to sequential execution.
    pub fn debug_port(mut self, port: u16) -> Self {
        self.debug_port = Some(port);
        self
    }

    /// Cap on live workers per trigger (default: 8, 0 for unlimited).
    pub fn max_workers_per_key(mut self, max: usize) -> Self {
        self.max_workers_per_key = max;
        self
    }

    /// Cap on concurrently running invocations (default: unlimited).
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn storage_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.storage_bucket = Some(bucket.into());
        self
    }

    pub fn companions(mut self, companions: CompanionEmulators) -> Self {
        self.companions = companions;
        self
    }

    pub fn backend(mut self, backend: EmulatableBackend) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = EmulatableBackend>) -> Self {
        self.backends.extend(backends);
        self
    }

    /// Process spawner (default: [`NativeSpawner`]).
    pub fn spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Trigger discovery (default: [`BackendDiscovery`]).
    pub fn discovery(mut self, discovery: Arc<dyn SourceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Request timeout for calls to companion emulators (default 30s).
    ///
    /// Multicast re-delivery is not bound by it.
    pub fn companion_timeout(mut self, timeout: Duration) -> Self {
        self.companion_timeout = timeout;
        self
    }

    /// Event service registrars (default: [`RegistrarTable::standard`]).
    pub fn registrars(mut self, registrars: RegistrarTable) -> Self {
        self.registrars = Some(registrars);
        self
    }

    /// Build the emulator.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> anyhow::Result<Arc<FunctionsEmulator>> {
        let project_id = self
            .project_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow::anyhow!("project_id is required"))?;
        if self.backends.is_empty() {
            anyhow::bail!("at least one backend is required");
        }

        let mode = if self.debug_port.is_some() {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Auto
        };

        let mut pools = HashMap::new();
        for backend in &self.backends {
            pools.entry(backend.codebase.clone()).or_insert_with(|| {
                let max = match mode {
                    ExecutionMode::Sequential => 1,
                    ExecutionMode::Auto => self.max_workers_per_key,
                };
                Arc::new(RuntimeWorkerPool::new(mode).with_max_workers_per_key(max))
            });
        }

        let http = reqwest::Client::builder()
            .timeout(self.companion_timeout)
            .build()?;
        // Deliveries last as long as the function runs.
        let delivery_http = reqwest::Client::builder().build()?;

        Ok(Arc::new(FunctionsEmulator {
            args: EmulatorArgs {
                project_id,
                project_alias: self.project_alias,
                host: self.host,
                port: self.port,
                debug_port: self.debug_port,
                socket_dir: self.socket_dir,
                storage_bucket: self.storage_bucket,
                companions: self.companions,
                mode,
            },
            backends: self.backends.into_iter().map(Arc::new).collect(),
            registry: RwLock::new(TriggerRegistry::new()),
            pools,
            queue: WorkQueue::new(mode).with_max_concurrency(self.max_concurrency),
            spawner: self.spawner.unwrap_or_else(|| Arc::new(NativeSpawner::new())),
            discovery: self.discovery.unwrap_or_else(|| Arc::new(BackendDiscovery::default())),
            registrars: self.registrars.unwrap_or_else(RegistrarTable::standard),
            http,
            delivery_http,
            watchers: Mutex::new(Vec::new()),
            server: Mutex::new(None),
            local_addr: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
        }))
    }
}

/// Settings fixed for the emulator's lifetime.
#[derive(Debug, Clone)]
pub struct EmulatorArgs {
    pub project_id: String,
    pub project_alias: Option<String>,
    pub host: String,
    pub port: u16,
    pub debug_port: Option<u16>,
    pub socket_dir: PathBuf,
    pub storage_bucket: Option<String>,
    pub companions: CompanionEmulators,
    pub mode: ExecutionMode,
}

struct HubServer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<std::io::Result<()>>,
}

/// A running functions emulator.
///
/// Lifecycle: [`start`](Self::start) binds the hub and starts the queue,
/// [`connect`](Self::connect) loads triggers and starts watching sources,
/// [`stop`](Self::stop) drains and tears everything down.
pub struct FunctionsEmulator {
    args: EmulatorArgs,
    backends: Vec<Arc<EmulatableBackend>>,
    registry: RwLock<TriggerRegistry>,
    pools: HashMap<String, Arc<RuntimeWorkerPool>>,
    queue: WorkQueue,
    spawner: Arc<dyn ProcessSpawner>,
    discovery: Arc<dyn SourceDiscovery>,
    registrars: RegistrarTable,
    http: reqwest::Client,
    delivery_http: reqwest::Client,
    watchers: Mutex<Vec<SourceWatcher>>,
    server: Mutex<Option<HubServer>>,
    local_addr: RwLock<Option<SocketAddr>>,
    load_lock: tokio::sync::Mutex<()>,
}

impl FunctionsEmulator {
    pub fn builder() -> FunctionsEmulatorBuilder {
        FunctionsEmulatorBuilder::new()
    }

    pub fn args(&self) -> &EmulatorArgs {
        &self.args
    }

    pub fn project_id(&self) -> &str {
        &self.args.project_id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.args.mode
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Client for companion emulators.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Client for re-delivering multicast events to the hub. Has no timeout.
    pub fn delivery_client(&self) -> &reqwest::Client {
        &self.delivery_http
    }

    pub fn backends(&self) -> &[Arc<EmulatableBackend>] {
        &self.backends
    }

    /// Worker pool serving a codebase.
    pub fn pool(&self, codebase: &str) -> Option<&Arc<RuntimeWorkerPool>> {
        self.pools.get(codebase)
    }

    fn pool_for(&self, codebase: &str) -> Result<Arc<RuntimeWorkerPool>> {
        self.pools
            .get(codebase)
            .cloned()
            .ok_or_else(|| Error::UnknownCodebase(codebase.to_string()))
    }

    /// Address the hub is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    fn port(&self) -> u16 {
        self.local_addr().map(|addr| addr.port()).unwrap_or(self.args.port)
    }

    /// Base URL of the hub.
    pub fn hub_url(&self) -> String {
        format!("http://{}:{}", self.args.host, self.port())
    }

    /// Public URL of an HTTPS function.
    pub fn https_url(&self, def: &TriggerDefinition) -> String {
        format!(
            "{}/{}/{}/{}",
            self.hub_url(),
            self.args.project_id,
            def.region,
            def.name
        )
    }

    /// Bind the hub and start the work queue.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        self.queue.start();

        let listener = TcpListener::bind((self.args.host.as_str(), self.args.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write() = Some(addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server::serve(listener, self.clone(), shutdown_rx));
        *self.server.lock() = Some(HubServer { shutdown_tx, handle });

        info!(
            addr = %addr,
            mode = self.args.mode.as_str(),
            spawner = self.spawner.spawner_type(),
            "Functions emulator started"
        );
        Ok(addr)
    }

    /// Load triggers from every backend and watch their sources.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        for backend in &self.backends {
            if backend.watch {
                info!(dir = %backend.functions_dir.display(), "Watching for functions");
                match self.watch_backend(backend) {
                    Ok(watcher) => self.watchers.lock().push(watcher),
                    Err(e) => warn!(dir = %backend.functions_dir.display(), error = %e, "Failed to watch functions source"),
                }
            }
            self.load_triggers(backend, true).await?;
        }
        self.perform_post_load_operations().await
    }

    fn watch_backend(self: &Arc<Self>, backend: &Arc<EmulatableBackend>) -> Result<SourceWatcher> {
        let emulator = Arc::downgrade(self);
        let backend = backend.clone();
        let dir = backend.functions_dir.clone();
        let reload: ReloadFn = Arc::new(move || {
            let emulator = emulator.clone();
            let backend = backend.clone();
            Box::pin(async move {
                let Some(emulator) = emulator.upgrade() else {
                    return;
                };
                if let Err(e) = emulator.load_triggers(&backend, false).await {
                    error!(codebase = %backend.codebase, error = %e, "Failed to reload functions");
                    return;
                }
                if let Err(e) = emulator.perform_post_load_operations().await {
                    warn!(error = %e, "Post-load operations failed");
                }
            })
        });
        Ok(SourceWatcher::start(dir, reload)?)
    }

    /// Drain, stop the queue, kill every runtime and shut the hub down.
    pub async fn stop(&self) -> Result<()> {
        info!("Functions emulator shutting down...");

        if tokio::time::timeout(STOP_FLUSH_TIMEOUT, self.queue.flush())
            .await
            .is_err()
        {
            warn!("Functions emulator work queue did not empty before stopping");
        }
        self.queue.stop();

        for pool in self.pools.values() {
            pool.exit();
        }

        for watcher in self.watchers.lock().drain(..) {
            watcher.stop();
        }

        let server = self.server.lock().take();
        if let Some(server) = server {
            let _ = server.shutdown_tx.send(true);
            match server.handle.await {
                Ok(Ok(())) => info!("Functions emulator shutdown complete"),
                Ok(Err(e)) => {
                    error!("Functions emulator hub error during shutdown: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Functions emulator hub task panicked: {}", e);
                    return Err(Error::Other(format!("hub task panicked: {}", e)));
                }
            }
        }
        Ok(())
    }

    fn env_context(&self) -> EnvContext<'_> {
        EnvContext {
            project_id: &self.args.project_id,
            project_alias: self.args.project_alias.as_deref(),
            companions: &self.args.companions,
            debug: self.args.debug_port.is_some(),
            storage_bucket: self.args.storage_bucket.as_deref(),
        }
    }

    /// Discover a backend's functions and register them.
    ///
    /// Definitions already served by an enabled record with the same entry
    /// point and event trigger are skipped unless `force` is set. A failed
    /// discovery is logged and leaves the current triggers in place.
    pub async fn load_triggers(self: &Arc<Self>, backend: &Arc<EmulatableBackend>, force: bool) -> Result<()> {
        let _guard = self.load_lock.lock().await;
        self.load_triggers_locked(backend, force).await
    }

    async fn load_triggers_locked(&self, backend: &Arc<EmulatableBackend>, force: bool) -> Result<()> {
        let mut env = runtime_env(&self.env_context(), backend, None, &self.args.socket_dir);
        env.remove("PORT");

        let definitions = match self.discovery.discover(backend, &env).await {
            Ok(definitions) => definitions,
            Err(e) => {
                error!(codebase = %backend.codebase, error = %e, "Failed to load function definition from source");
                return Ok(());
            }
        };
        info!(
            codebase = %backend.codebase,
            "Loaded functions definitions from source: {}",
            definitions.iter().map(|d| d.entry_point.as_str()).collect::<Vec<_>>().join(", ")
        );

        let pool = self.pool_for(&backend.codebase)?;
        pool.refresh();
        self.registry.write().reset_blocking_config();

        let to_setup: Vec<TriggerDefinition> = {
            let registry = self.registry.read();
            definitions
                .into_iter()
                .filter(|def| force || !registry.has_enabled_match(def))
                .collect()
        };

        for def in to_setup {
            if !is_valid_function_name(&def.name) {
                return Err(Error::InvalidFunctionId(def.id.clone()));
            }
            self.setup_trigger(backend, def).await?;
        }

        if self.args.mode == ExecutionMode::Sequential
            && let Err(e) = self.start_shared_runtime(backend, &pool).await
        {
            warn!(codebase = %backend.codebase, error = %e, "Failed to start shared runtime");
        }
        Ok(())
    }

    async fn setup_trigger(&self, backend: &Arc<EmulatableBackend>, def: TriggerDefinition) -> Result<()> {
        let key = self.registry.read().trigger_key(&def);
        let mut url = None;

        let (added, kind) = match &def.kind {
            TriggerKind::HttpsTrigger(_) | TriggerKind::CallableTrigger(_) => {
                url = Some(self.https_url(&def));
                (true, "http")
            }
            TriggerKind::BlockingTrigger(blocking) => {
                let function_url = self.https_url(&def);
                let added = self.registry.write().blocking_config_mut().register(
                    &blocking.event_type,
                    function_url.clone(),
                    blocking.options,
                );
                url = Some(function_url);
                (added, EventService::Auth.name())
            }
            TriggerKind::EventTrigger(_) | TriggerKind::ScheduleTrigger(_) => {
                let hub_url = self.hub_url();
                let ctx = RegistrationContext {
                    project_id: &self.args.project_id,
                    key: &key,
                    definition: &def,
                    emulators: &self.args.companions,
                    http: &self.http,
                    hub_url: &hub_url,
                };
                let added = match self.registrars.register(&ctx).await? {
                    Registration::Registered => true,
                    Registration::Multicast(event_key) => {
                        self.registry.write().add_multicast(event_key, key.clone());
                        true
                    }
                    Registration::Ignored => false,
                };
                let service = EventService::for_definition(&def).map(|s| s.name()).unwrap_or("unknown");
                (added, service)
            }
        };

        let ignored = !added;
        if ignored {
            info!(
                function = %def.id,
                "function ignored because the {} emulator does not exist or is not running.",
                kind
            );
        } else if let Some(url) = &url {
            info!(function = %def.id, "{} function initialized ({}).", kind, url);
        } else {
            info!(function = %def.id, "{} function initialized.", kind);
        }

        self.registry.write().add(TriggerRecord {
            def: Arc::new(def),
            enabled: true,
            backend: backend.clone(),
            ignored,
            url,
        });
        Ok(())
    }

    /// Start the runtime shared by every function in sequential mode.
    async fn start_shared_runtime(&self, backend: &Arc<EmulatableBackend>, pool: &RuntimeWorkerPool) -> Result<()> {
        let Some(permit) = pool.try_begin_start(None) else {
            return Ok(());
        };
        let instance = self.start_runtime(backend, None).await?;
        let worker = pool.add_reserved_worker(None, instance, backend.log_info());
        drop(permit);

        let ready = worker.wait_for_socket_ready().await;
        if ready.is_err() {
            worker.retire();
        }
        worker.finish_request();
        ready.map_err(Into::into)
    }

    /// Bump the generation and reload every backend.
    pub async fn reload_triggers(self: &Arc<Self>) -> Result<()> {
        {
            let _guard = self.load_lock.lock().await;
            let generation = self.registry.write().bump_generation();
            debug!(generation, "Reloading triggers");
            for backend in &self.backends {
                self.load_triggers_locked(backend, false).await?;
            }
        }
        self.perform_post_load_operations().await
    }

    /// Push the auth blocking functions config to the auth emulator.
    pub async fn perform_post_load_operations(&self) -> Result<()> {
        let config = self.registry.read().blocking_config().clone();
        if config.triggers == BlockingTriggers::default() {
            return Ok(());
        }
        let Some(auth) = self.args.companions.url(Companion::Auth) else {
            return Ok(());
        };

        let url = format!(
            "{}/identitytoolkit.googleapis.com/v2/projects/{}/config",
            auth, self.args.project_id
        );
        let result = self
            .http
            .patch(url)
            .query(&[("updateMask", "blockingFunctions")])
            .header(reqwest::header::AUTHORIZATION, OWNER_AUTHORIZATION)
            .json(&serde_json::json!({ "blockingFunctions": config }))
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(e) = result {
            warn!(error = %e, "Error updating blocking functions config to the auth emulator");
            return Err(e.into());
        }
        Ok(())
    }

    /// Disable every background trigger and wait for in-flight work.
    pub async fn disable_background_triggers(&self) {
        let disabled = self.registry.write().disable_background();
        info!(count = disabled, "Disabled background triggers");
        self.queue.flush().await;
    }

    /// Spawn a runtime for a backend, dedicated to `trigger` when given.
    pub async fn start_runtime(
        &self,
        backend: &EmulatableBackend,
        trigger: Option<&TriggerDefinition>,
    ) -> Result<RuntimeInstance> {
        let id = Uuid::new_v4().simple().to_string();
        let socket_path = self.args.socket_dir.join(format!("fire_emu_{}.sock", &id[..16]));
        let env = runtime_env(&self.env_context(), backend, trigger, &socket_path);
        let inspect = self.args.debug_port.map(|port| (self.args.host.as_str(), port));

        let options = SpawnOptions {
            program: backend.runtime_program(),
            args: backend.runtime_arguments(inspect),
            cwd: backend.functions_dir.clone(),
            env,
            socket_path: socket_path.clone(),
        };
        let process = self.spawner.spawn(&options).await?;
        debug!(
            function = trigger.map(|t| t.id.as_str()).unwrap_or("~shared~"),
            socket = %socket_path.display(),
            pid = ?process.pid,
            "Started runtime"
        );

        Ok(RuntimeInstance {
            process,
            socket_path,
            cwd: backend.functions_dir.clone(),
        })
    }

    /// Claim an idle worker for `def`, starting one if the pool has room
    /// and otherwise waiting for one to free up.
    async fn acquire_worker(
        &self,
        backend: &Arc<EmulatableBackend>,
        pool: &RuntimeWorkerPool,
        def: &TriggerDefinition,
    ) -> Result<Arc<RuntimeWorker>> {
        let changed = pool.changed();
        let dedicated = self.args.mode == ExecutionMode::Auto;
        let owner = dedicated.then_some(def.id.as_str());

        loop {
            let notified = changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(worker) = pool.claim_idle_worker(Some(&def.id)) {
                return Ok(worker);
            }

            if let Some(permit) = pool.try_begin_start(Some(&def.id)) {
                let instance = self.start_runtime(backend, dedicated.then_some(def)).await?;
                let worker = pool.add_reserved_worker(owner, instance, backend.log_info());
                drop(permit);

                if let Err(e) = worker.wait_for_socket_ready().await {
                    worker.retire();
                    worker.finish_request();
                    return Err(e.into());
                }
                return Ok(worker);
            }

            debug!("[worker-pool] {} at capacity, waiting for a worker", def.id);
            notified.await;
        }
    }

    async fn run_invocation(&self, record: &TriggerRecord, request: ProxyRequest) -> Result<ProxiedResponse> {
        let def = &record.def;
        let pool = self.pool_for(&record.backend.codebase)?;
        let worker = self.acquire_worker(&record.backend, &pool, def).await?;

        let bundle = (self.args.mode == ExecutionMode::Sequential).then(|| DebugBundle {
            function_target: def.entry_point.clone(),
            function_signature: def.signature_type(),
        });
        debug!(function = %def.id, worker = %worker.id(), "Runtime ready, sending request");
        Ok(pool.dispatch_claimed(&worker, request, bundle).await?)
    }

    /// Run a request against a trigger through the work queue.
    ///
    /// Resolves with the runtime's response as soon as its headers arrive;
    /// the queue slot is held until the body has been streamed.
    pub async fn invoke(self: &Arc<Self>, record: TriggerRecord, request: ProxyRequest) -> Result<Response<Body>> {
        let (response_tx, response_rx) = oneshot::channel::<Result<Response<Body>>>();
        let emulator = self.clone();

        let task = self.queue.submit(async move {
            match emulator.run_invocation(&record, request).await {
                Ok(ProxiedResponse { response, completion }) => {
                    let _ = response_tx.send(Ok(response));
                    completion.await;
                }
                Err(e) => {
                    warn!(function = %record.def.id, error = %e, "Invocation failed");
                    let _ = response_tx.send(Err(e));
                }
            }
        });

        match response_rx.await {
            Ok(result) => result,
            Err(_) => match task.await {
                Err(e) => Err(e.into()),
                Ok(()) => Err(QueueError::Dropped.into()),
            },
        }
    }

    /// Invoke a background trigger directly with a JSON body.
    pub async fn send_request(
        self: &Arc<Self>,
        trigger: &TriggerDefinition,
        body: &serde_json::Value,
    ) -> Result<Response<Body>> {
        let key = self.trigger_key(trigger);
        let record = self
            .trigger_record(&key)
            .ok_or(Error::TriggerNotFound(key))?;
        self.invoke(record, ProxyRequest::json(body)).await
    }

    pub fn trigger_key(&self, def: &TriggerDefinition) -> String {
        self.registry.read().trigger_key(def)
    }

    /// Enabled record under `key`.
    pub fn trigger_record(&self, key: &str) -> Option<TriggerRecord> {
        self.registry.read().get_enabled(key).cloned()
    }

    pub fn enabled_trigger_keys(&self) -> Vec<String> {
        self.registry.read().enabled_keys()
    }

    pub fn trigger_definitions(&self) -> Vec<Arc<TriggerDefinition>> {
        self.registry.read().definitions()
    }

    /// Enabled trigger keys listening on an event key.
    pub fn multicast_targets(&self, event_key: &str) -> Vec<String> {
        self.registry.read().multicast_targets(event_key)
    }

    pub fn blocking_config(&self) -> BlockingFunctionsConfig {
        self.registry.read().blocking_config().clone()
    }

    /// Backends with their env and the triggers of their codebase.
    pub fn backend_info(&self) -> Vec<BackendInfo> {
        let registry = self.registry.read();
        self.backends
            .iter()
            .map(|backend| BackendInfo {
                directory: backend.functions_dir.display().to_string(),
                env: backend.display_env(&self.args.project_id),
                extension_instance_id: backend.extension_instance_id.clone(),
                extension_version: backend.extension_version.clone(),
                function_triggers: registry.definitions_for_codebase(&backend.codebase),
            })
            .collect()
    }

    /// Replace every trigger with `definitions`, all served by `backend`.
    pub fn set_triggers_for_testing(&self, definitions: Vec<TriggerDefinition>, backend: Arc<EmulatableBackend>) {
        self.registry.write().replace_all(definitions, backend);
    }
}
