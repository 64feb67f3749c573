// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP hub tests: routing, dispatch and multicast against mock runtimes.

mod common;

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::json;

use common::*;
use emulator_functions::process::{ProcessError, ProcessSpawner, RuntimeProcess, SpawnOptions};
use emulator_functions::{EmulatableBackend, ExecutionMode, FunctionsEmulator, MockSpawner, WorkerState};
use emulator_protocol::HEALTH_CHECK_PATH;

/// Spawner whose runtimes fail to start after a short delay.
struct DelayedFailingSpawner;

#[async_trait]
impl ProcessSpawner for DelayedFailingSpawner {
    fn spawner_type(&self) -> &'static str {
        "delayed-failing"
    }

    async fn spawn(&self, _options: &SpawnOptions) -> emulator_functions::process::Result<RuntimeProcess> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err(ProcessError::SpawnFailed("runtime exited during startup".to_string()))
    }
}

/// Runtime router that records how many requests run at once.
fn in_flight_router(current: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Router {
    Router::new().fallback(move |request: Request| {
        let current = current.clone();
        let peak = peak.clone();
        async move {
            if request.uri().path() != HEALTH_CHECK_PATH {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }
            "ok"
        }
    })
}

/// Runtime router whose response body finishes slowly. `completed` counts
/// bodies streamed to the end.
fn slow_body_router(completed: Arc<AtomicUsize>, delay: Duration) -> Router {
    Router::new().fallback(move |request: Request| {
        let completed = completed.clone();
        async move {
            if request.uri().path() == HEALTH_CHECK_PATH {
                return Body::from("ok");
            }
            let head = futures::stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"working ")) });
            let tail = futures::stream::once(async move {
                tokio::time::sleep(delay).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Bytes::from_static(b"done"))
            });
            Body::from_stream(head.chain(tail))
        }
    })
}

fn id_token(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.", header, payload)
}

// ============================================================================
// HTTPS functions
// ============================================================================

#[tokio::test]
async fn test_unknown_function_returns_404_without_spawning() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![https("api")]).await;

    let response = env
        .http
        .get(env.url("/demo-project/us-central1/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let text = response.text().await.unwrap();
    assert_eq!(
        text,
        "Function us-central1-missing does not exist, valid functions are: us-central1-api"
    );
    assert_eq!(env.spawner.spawn_count(), 0);

    env.stop().await;
}

#[tokio::test]
async fn test_https_request_rewrites_path() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![https("api")]).await;

    let response = env
        .http
        .post(env.url("/demo-project/us-central1/api/users/42?expand=true"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/users/42?expand=true");
    assert_eq!(echoed["body"], "hello");

    let response = env
        .http
        .get(env.url("/demo-project/us-central1/api"))
        .send()
        .await
        .unwrap();
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["path"], "/");

    assert_eq!(env.spawner.spawn_count(), 1);
    let options = &env.spawner.processes()[0].options;
    assert_eq!(options.env["FUNCTION_TARGET"], "api");
    assert_eq!(options.env["GCLOUD_PROJECT"], "demo-project");
    assert_eq!(options.env["PORT"], options.socket_path.display().to_string());

    env.stop().await;
}

#[tokio::test]
async fn test_wrong_project_is_rejected() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![https("api")]).await;

    let response = env
        .http
        .get(env.url("/other-project/us-central1/api"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(env.spawner.spawn_count(), 0);

    env.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_respect_worker_cap() {
    let env = TestEmulator::start_with(MockSpawner::new(echo_router()), vec![https("api")], |builder| {
        builder.max_workers_per_key(1)
    })
    .await;

    let requests = (0..4).map(|_| {
        env.http
            .get(env.url("/demo-project/us-central1/api"))
            .send()
    });
    for response in futures::future::join_all(requests).await {
        assert_eq!(response.unwrap().status(), StatusCode::OK);
    }
    assert_eq!(env.spawner.spawn_count(), 1);

    env.stop().await;
}

#[tokio::test]
async fn test_failed_startup_surfaces_error() {
    let spawner = MockSpawner::new(echo_router()).failing();
    let env = TestEmulator::start(spawner, vec![https("api")]).await;

    let response = env
        .http
        .get(env.url("/demo-project/us-central1/api"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("mock spawn failure"));

    env.stop().await;
}

#[tokio::test]
async fn test_failed_startup_wakes_waiting_requests() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = EmulatableBackend::new(dir.path());
    backend.watch = false;
    backend.predefined_triggers = Some(vec![https("api")]);
    let emulator = FunctionsEmulator::builder()
        .project_id(PROJECT_ID)
        .port(0)
        .socket_dir(dir.path())
        .backend(backend)
        .spawner(Arc::new(DelayedFailingSpawner))
        .max_workers_per_key(1)
        .build()
        .unwrap();
    let addr = emulator.start().await.unwrap();
    emulator.connect().await.unwrap();

    let http = reqwest::Client::new();
    let url = format!("http://{}/demo-project/us-central1/api", addr);
    let requests = (0..2).map(|_| http.get(&url).send());
    let responses = tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(requests))
        .await
        .expect("waiting request was never woken");
    for response in responses {
        assert_eq!(response.unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    emulator.stop().await.unwrap();
}

// ============================================================================
// Callable functions
// ============================================================================

#[tokio::test]
async fn test_callable_receives_decoded_identity() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![callable("secure")]).await;
    let token = id_token(json!({ "sub": "user-1", "email": "a@example.com" }));

    let response = env
        .http
        .post(env.url("/demo-project/us-central1/secure"))
        .bearer_auth(&token)
        .json(&json!({ "data": {} }))
        .send()
        .await
        .unwrap();
    let echoed: serde_json::Value = response.json().await.unwrap();
    let headers = &echoed["headers"];

    assert!(headers.get("authorization").is_none());
    assert_eq!(headers["x-original-auth"], format!("Bearer {}", token));

    let encoded = headers["x-callable-context-auth"].as_str().unwrap();
    let context: serde_json::Value =
        serde_json::from_str(&urlencoding::decode(encoded).unwrap()).unwrap();
    assert_eq!(context["uid"], "user-1");
    assert_eq!(context["token"]["email"], "a@example.com");

    env.stop().await;
}

#[tokio::test]
async fn test_https_function_keeps_authorization() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![https("api")]).await;
    let token = id_token(json!({ "sub": "user-1" }));

    let response = env
        .http
        .get(env.url("/demo-project/us-central1/api"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["headers"]["authorization"], format!("Bearer {}", token));
    assert!(echoed["headers"].get("x-callable-context-auth").is_none());

    env.stop().await;
}

// ============================================================================
// Background functions
// ============================================================================

#[tokio::test]
async fn test_background_trigger_by_key() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![storage_event("onUpload", "photos")]).await;

    let response = env
        .post_json(
            "/functions/projects/demo-project/triggers/us-central1-onUpload-0",
            json!({ "data": { "name": "a.png" } }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["path"], "/");
    assert!(echoed["body"].as_str().unwrap().contains("a.png"));

    let missing = env
        .post_json("/functions/projects/demo-project/triggers/us-central1-nope-0", json!({}))
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    env.stop().await;
}

#[tokio::test]
async fn test_send_request_invokes_directly() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![storage_event("onUpload", "photos")]).await;
    let def = definition(
        "onUpload",
        storage_event("onUpload", "photos").kind,
    );

    let response = env
        .emulator
        .send_request(&def, &json!({ "data": { "name": "b.png" } }))
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(echoed["body"].as_str().unwrap().contains("b.png"));

    env.stop().await;
}

#[tokio::test]
async fn test_multicast_delivers_once_and_acknowledges() {
    let count = Arc::new(AtomicUsize::new(0));
    let env = TestEmulator::start(
        MockSpawner::new(counting_router(count.clone())),
        vec![storage_event("onUpload", "photos"), storage_event("onOther", "other-bucket")],
    )
    .await;

    let response = env
        .post_json(
            "/functions/projects/demo-project/trigger_multicast",
            json!({
                "eventType": "google.storage.object.finalize",
                "data": { "bucket": "photos", "name": "a.png" }
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack: serde_json::Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "multicast_acknowledged");

    assert!(eventually(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(env.spawner.spawn_count(), 1);

    env.stop().await;
}

#[tokio::test]
async fn test_multicast_delivery_outlives_companion_timeout() {
    let completed = Arc::new(AtomicUsize::new(0));
    let env = TestEmulator::start_with(
        MockSpawner::new(slow_body_router(completed.clone(), Duration::from_millis(600))),
        vec![storage_event("onUpload", "photos")],
        |builder| builder.companion_timeout(Duration::from_millis(100)),
    )
    .await;

    let response = env
        .post_json(
            "/functions/projects/demo-project/trigger_multicast",
            json!({
                "eventType": "google.storage.object.finalize",
                "data": { "bucket": "photos", "name": "slow.png" }
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    assert!(eventually(Duration::from_secs(5), || completed.load(Ordering::SeqCst) == 1).await);

    env.stop().await;
}

#[tokio::test]
async fn test_malformed_multicast_is_rejected() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![storage_event("onUpload", "photos")]).await;

    let response = env
        .http
        .post(env.url("/functions/projects/demo-project/trigger_multicast"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(env.spawner.spawn_count(), 0);

    env.stop().await;
}

#[tokio::test]
async fn test_disable_background_triggers() {
    let env = TestEmulator::start(
        MockSpawner::new(echo_router()),
        vec![https("api"), storage_event("onUpload", "photos")],
    )
    .await;

    env.emulator.disable_background_triggers().await;
    assert_eq!(env.emulator.enabled_trigger_keys(), vec!["us-central1-api".to_string()]);
    assert!(
        env.emulator
            .multicast_targets("demo-project:google.storage.object.finalize:photos")
            .is_empty()
    );

    env.stop().await;
}

// ============================================================================
// Introspection and routing
// ============================================================================

#[tokio::test]
async fn test_backends_lists_triggers() {
    let env = TestEmulator::start(
        MockSpawner::new(echo_router()),
        vec![https("api"), storage_event("onUpload", "photos")],
    )
    .await;

    let response = env.http.get(env.url("/backends")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    let backends = body["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0]["functionTriggers"].as_array().unwrap().len(), 2);
    assert_eq!(
        backends[0]["directory"],
        env.dir.path().display().to_string()
    );

    env.stop().await;
}

#[tokio::test]
async fn test_unmatched_route_is_404() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![https("api")]).await;

    let response = env.http.get(env.url("/nothing")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    env.stop().await;
}

// ============================================================================
// Sequential mode
// ============================================================================

#[tokio::test]
async fn test_sequential_mode_shares_one_runtime() {
    let env = TestEmulator::start_with(
        MockSpawner::new(echo_router()),
        vec![https("first"), https("second")],
        |builder| builder.debug_port(9229),
    )
    .await;
    assert_eq!(env.emulator.mode(), ExecutionMode::Sequential);
    assert_eq!(env.spawner.spawn_count(), 1);

    for name in ["first", "second", "first"] {
        let response = env
            .http
            .get(env.url(&format!("/demo-project/us-central1/{}", name)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(env.spawner.spawn_count(), 1);

    let process = &env.spawner.processes()[0];
    assert!(process.options.args[0].starts_with("--inspect="));
    let targets: Vec<String> = process
        .control_messages()
        .iter()
        .map(|line| {
            let bundle: serde_json::Value = serde_json::from_str(line).unwrap();
            bundle["functionTarget"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(targets, vec!["first", "second", "first"]);

    env.stop().await;
}

#[tokio::test]
async fn test_sequential_mode_serializes_concurrent_requests() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let env = TestEmulator::start_with(
        MockSpawner::new(in_flight_router(current.clone(), peak.clone())),
        vec![https("first"), https("second")],
        |builder| builder.debug_port(9229),
    )
    .await;

    let requests = (0..6).map(|i| {
        let name = if i % 2 == 0 { "first" } else { "second" };
        env.http
            .get(env.url(&format!("/demo-project/us-central1/{}", name)))
            .send()
    });
    for response in futures::future::join_all(requests).await {
        assert_eq!(response.unwrap().status(), StatusCode::OK);
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(current.load(Ordering::SeqCst), 0);
    assert_eq!(env.spawner.spawn_count(), 1);
    assert_eq!(env.spawner.processes()[0].control_messages().len(), 6);

    env.stop().await;
}

// ============================================================================
// Reloading
// ============================================================================

#[tokio::test]
async fn test_reload_retires_workers_and_rekeys_changed_triggers() {
    let discovery = SwitchableDiscovery::new(vec![
        https("api"),
        storage_event("onUpload", "photos"),
        storage_event("onStable", "other"),
    ]);
    let env = TestEmulator::start_with(MockSpawner::new(echo_router()), vec![], {
        let discovery = discovery.clone();
        move |builder| builder.discovery(discovery)
    })
    .await;
    assert!(env.emulator.trigger_record("us-central1-onUpload-0").is_some());

    let response = env
        .http
        .get(env.url("/demo-project/us-central1/api"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let pool = env.emulator.pool("default").unwrap().clone();
    let old_worker = pool.workers_for(Some("us-central1-api")).remove(0);

    discovery.set(vec![
        https("api"),
        storage_event("onUpload", "archive"),
        storage_event("onStable", "other"),
    ]);
    env.emulator.reload_triggers().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), old_worker.wait_for_state(WorkerState::Finished))
        .await
        .unwrap();

    let response = env
        .http
        .get(env.url("/demo-project/us-central1/api"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(env.spawner.spawn_count(), 2);

    // Changed triggers move to the new generation; unchanged ones keep their key.
    assert!(env.emulator.trigger_record("us-central1-onUpload-1").is_some());
    assert!(env.emulator.trigger_record("us-central1-onStable-0").is_some());
    assert!(env.emulator.trigger_record("us-central1-onStable-1").is_none());
    assert_eq!(
        env.emulator.multicast_targets("demo-project:google.storage.object.finalize:archive"),
        vec!["us-central1-onUpload-1".to_string()]
    );

    let response = env
        .post_json(
            "/functions/projects/demo-project/triggers/us-central1-onUpload-1",
            json!({ "data": { "name": "b.png" } }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    env.stop().await;
}

#[tokio::test]
async fn test_source_change_retires_workers() {
    let env = TestEmulator::start_watching(MockSpawner::new(echo_router()), vec![https("api")]).await;

    env.http
        .get(env.url("/demo-project/us-central1/api"))
        .send()
        .await
        .unwrap();
    let pool = env.emulator.pool("default").unwrap().clone();
    let worker = pool.workers_for(Some("us-central1-api")).remove(0);

    std::fs::write(env.dir.path().join("index.js"), "exports.api = () => {};").unwrap();

    tokio::time::timeout(Duration::from_secs(10), worker.wait_for_state(WorkerState::Finished))
        .await
        .expect("source change did not reload");
    assert!(env.emulator.trigger_record("us-central1-api").is_some());

    env.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_stop_kills_runtimes() {
    let env = TestEmulator::start(MockSpawner::new(echo_router()), vec![https("api")]).await;
    env.http
        .get(env.url("/demo-project/us-central1/api"))
        .send()
        .await
        .unwrap();

    let pool = env.emulator.pool("default").unwrap().clone();
    let workers = pool.workers_for(Some("us-central1-api"));
    assert_eq!(workers.len(), 1);

    let spawner = env.spawner.clone();
    env.stop().await;

    tokio::time::timeout(Duration::from_secs(5), workers[0].wait_for_state(WorkerState::Finished))
        .await
        .unwrap();
    assert!(spawner.processes()[0].was_killed());
}
