// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for emulator-functions tests.
//!
//! Runtimes are served by [`MockSpawner`]: every spawned "process" is an
//! axum router listening on the requested Unix socket.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::response::Json;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use emulator_functions::discovery::SourceDiscovery;
use emulator_functions::process::{ProcessSpawner, RuntimeInstance, SpawnOptions};
use emulator_functions::trigger::{CallableTrigger, EventTrigger, HttpsTrigger, Platform};
use emulator_functions::{
    EmulatableBackend, FunctionsEmulator, FunctionsEmulatorBuilder, MockSpawner, TriggerDefinition, TriggerKind,
    TriggerSpec,
};

pub const PROJECT_ID: &str = "demo-project";

pub fn definition(name: &str, kind: TriggerKind) -> TriggerDefinition {
    spec(name, kind).expand("default").remove(0)
}

pub fn spec(name: &str, kind: TriggerKind) -> TriggerSpec {
    TriggerSpec {
        name: name.to_string(),
        entry_point: None,
        regions: vec![],
        platform: Platform::Gcfv1,
        kind,
        labels: Default::default(),
        timeout_seconds: None,
        available_memory_mb: None,
        secret_environment_variables: vec![],
    }
}

pub fn https(name: &str) -> TriggerSpec {
    spec(name, TriggerKind::HttpsTrigger(HttpsTrigger::default()))
}

pub fn callable(name: &str) -> TriggerSpec {
    spec(name, TriggerKind::CallableTrigger(CallableTrigger::default()))
}

pub fn storage_event(name: &str, bucket: &str) -> TriggerSpec {
    spec(
        name,
        TriggerKind::EventTrigger(EventTrigger {
            event_type: "google.storage.object.finalize".to_string(),
            resource: Some(format!("projects/_/buckets/{}", bucket)),
            ..Default::default()
        }),
    )
}

/// Discovery whose trigger list can be swapped between loads.
pub struct SwitchableDiscovery {
    specs: Mutex<Vec<TriggerSpec>>,
}

impl SwitchableDiscovery {
    pub fn new(specs: Vec<TriggerSpec>) -> Arc<Self> {
        Arc::new(Self {
            specs: Mutex::new(specs),
        })
    }

    pub fn set(&self, specs: Vec<TriggerSpec>) {
        *self.specs.lock() = specs;
    }
}

#[async_trait::async_trait]
impl SourceDiscovery for SwitchableDiscovery {
    async fn discover(
        &self,
        backend: &EmulatableBackend,
        _env: &HashMap<String, String>,
    ) -> emulator_functions::Result<Vec<TriggerDefinition>> {
        Ok(self
            .specs
            .lock()
            .iter()
            .flat_map(|spec| spec.expand(&backend.codebase))
            .collect())
    }
}

/// Runtime router that echoes what it received as JSON.
pub fn echo_router() -> Router {
    Router::new().fallback(|request: Request| async move {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
        Json(json!({
            "method": parts.method.as_str(),
            "path": parts.uri.to_string(),
            "headers": header_map(&parts.headers),
            "body": String::from_utf8_lossy(&body),
        }))
    })
}

/// Runtime router that counts non-health requests.
pub fn counting_router(count: Arc<AtomicUsize>) -> Router {
    Router::new().fallback(move |request: Request| {
        let count = count.clone();
        async move {
            if request.uri().path() != emulator_protocol::HEALTH_CHECK_PATH {
                count.fetch_add(1, Ordering::SeqCst);
            }
            "ok"
        }
    })
}

fn header_map(headers: &HeaderMap) -> serde_json::Map<String, serde_json::Value> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                json!(value.to_str().unwrap_or_default()),
            )
        })
        .collect()
}

/// Spawn a mock runtime directly, for worker and pool tests.
pub async fn spawn_runtime(spawner: &MockSpawner, dir: &TempDir) -> RuntimeInstance {
    let socket_path = dir
        .path()
        .join(format!("rt-{}.sock", spawner.spawn_count()));
    let options = SpawnOptions {
        program: "node".into(),
        args: vec![],
        cwd: dir.path().to_path_buf(),
        env: Default::default(),
        socket_path: socket_path.clone(),
    };
    let process = spawner.spawn(&options).await.expect("mock spawn");
    RuntimeInstance {
        process,
        socket_path,
        cwd: dir.path().to_path_buf(),
    }
}

/// Poll until `condition` holds or the timeout elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// A started emulator backed by mock runtimes.
pub struct TestEmulator {
    pub emulator: Arc<FunctionsEmulator>,
    pub spawner: Arc<MockSpawner>,
    pub addr: SocketAddr,
    pub http: reqwest::Client,
    /// Functions directory of the backend.
    pub dir: TempDir,
    /// Runtime sockets, kept apart from the watched sources.
    pub sockets: TempDir,
}

impl TestEmulator {
    /// Start an emulator serving `triggers` and load them.
    pub async fn start(spawner: MockSpawner, triggers: Vec<TriggerSpec>) -> Self {
        Self::start_with(spawner, triggers, |builder| builder).await
    }

    pub async fn start_with(
        spawner: MockSpawner,
        triggers: Vec<TriggerSpec>,
        configure: impl FnOnce(FunctionsEmulatorBuilder) -> FunctionsEmulatorBuilder,
    ) -> Self {
        Self::launch(spawner, triggers, false, configure).await
    }

    /// Start an emulator that watches its functions directory.
    pub async fn start_watching(spawner: MockSpawner, triggers: Vec<TriggerSpec>) -> Self {
        Self::launch(spawner, triggers, true, |builder| builder).await
    }

    async fn launch(
        spawner: MockSpawner,
        triggers: Vec<TriggerSpec>,
        watch: bool,
        configure: impl FnOnce(FunctionsEmulatorBuilder) -> FunctionsEmulatorBuilder,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let sockets = tempfile::tempdir().expect("socket tempdir");
        let mut backend = EmulatableBackend::new(dir.path());
        backend.watch = watch;
        backend.predefined_triggers = Some(triggers);

        let spawner = Arc::new(spawner);
        let builder = FunctionsEmulator::builder()
            .project_id(PROJECT_ID)
            .port(0)
            .socket_dir(sockets.path())
            .backend(backend)
            .spawner(spawner.clone());
        let emulator = configure(builder).build().expect("build emulator");

        let addr = emulator.start().await.expect("start emulator");
        emulator.connect().await.expect("connect emulator");

        Self {
            emulator,
            spawner,
            addr,
            http: reqwest::Client::new(),
            dir,
            sockets,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request")
    }

    pub async fn stop(self) {
        self.emulator.stop().await.expect("stop emulator");
    }
}
