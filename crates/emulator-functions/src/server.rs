// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP hub.
//!
//! Routes:
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /backends` | Backend and trigger introspection |
//! | `POST /functions/projects/{project}/triggers/{key}` | Background invocation |
//! | `POST /functions/projects/{project}/trigger_multicast` | Fan an event out to every subscriber |
//! | `ANY /{project}/{region}/{name}[/*]` | HTTPS and callable functions |

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{apply_callable_auth, needs_callable_auth};
use crate::emulator::FunctionsEmulator;
use crate::error::Error;
use crate::work_queue::QueueError;
use crate::worker::ProxyRequest;

/// Largest request body accepted by the hub.
pub const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

type HubState = Arc<FunctionsEmulator>;

/// Errors turned into hub responses.
#[derive(Debug)]
pub enum HubError {
    /// No enabled function answers to the id.
    FunctionNotFound { id: String, valid: Vec<String> },
    /// The request does not belong to this emulator.
    BadRequest(String),
    Emulator(Error),
}

impl From<Error> for HubError {
    fn from(e: Error) -> Self {
        HubError::Emulator(e)
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        match self {
            HubError::FunctionNotFound { id, valid } => (
                StatusCode::NOT_FOUND,
                format!(
                    "Function {} does not exist, valid functions are: {}",
                    id,
                    valid.join(", ")
                ),
            )
                .into_response(),
            HubError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            HubError::Emulator(Error::TriggerNotFound(key)) => {
                (StatusCode::NOT_FOUND, format!("Function {} does not exist", key)).into_response()
            }
            HubError::Emulator(Error::MalformedEvent(message)) => {
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            HubError::Emulator(Error::Queue(QueueError::Stopped)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Functions emulator is shutting down" })),
            )
                .into_response(),
            HubError::Emulator(e) => {
                error!(error = %e, "Function invocation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

/// Build the hub router.
pub fn router(emulator: HubState) -> Router {
    let backends = Router::new()
        .route("/backends", get(list_backends))
        .layer(CorsLayer::permissive());

    Router::new()
        .merge(backends)
        .route(
            "/functions/projects/{project_id}/triggers/{*trigger_key}",
            post(background_trigger),
        )
        .route(
            "/functions/projects/{project_id}/trigger_multicast",
            post(multicast_trigger),
        )
        .route("/{project_id}/{region}/{trigger_name}", any(https_trigger))
        .route("/{project_id}/{region}/{trigger_name}/{*rest}", any(https_trigger))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(emulator)
}

/// Serve the hub until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    emulator: HubState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(emulator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Functions emulator hub shutting down");
        })
        .await
}

async fn list_backends(State(emulator): State<HubState>) -> Json<serde_json::Value> {
    Json(json!({ "backends": emulator.backend_info() }))
}

async fn not_found(method: Method, uri: Uri) -> StatusCode {
    debug!(method = %method, path = %uri.path(), "No route for request");
    StatusCode::NOT_FOUND
}

fn check_project(emulator: &FunctionsEmulator, project_id: &str) -> Result<(), HubError> {
    if project_id != emulator.project_id() {
        return Err(HubError::BadRequest(format!(
            "Project {} is not served by this emulator, expected {}",
            project_id,
            emulator.project_id()
        )));
    }
    Ok(())
}

async fn background_trigger(
    State(emulator): State<HubState>,
    Path((project_id, trigger_key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HubError> {
    check_project(&emulator, &project_id)?;
    let record = emulator
        .trigger_record(&trigger_key)
        .ok_or_else(|| Error::TriggerNotFound(trigger_key.clone()))?;

    debug!(function = %record.def.id, key = %trigger_key, "Accepted background invocation");
    let mut request = ProxyRequest::new(Method::POST, "/");
    request.headers = headers;
    request.body = body;
    Ok(emulator.invoke(record, request).await?)
}

/// Event key for a multicast delivery: project, event type, then the bucket
/// for storage events.
pub fn multicast_key(project_id: &str, headers: &HeaderMap, event: &serde_json::Value) -> Result<String, Error> {
    let is_cloud_event = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("cloudevent"));
    let type_field = if is_cloud_event { "type" } else { "eventType" };
    let event_type = event
        .get(type_field)
        .and_then(|value| value.as_str())
        .ok_or_else(|| Error::MalformedEvent(format!("event has no {} field", type_field)))?;

    let mut key = format!("{}:{}", project_id, event_type);
    if let Some(bucket) = event.pointer("/data/bucket").and_then(|value| value.as_str()) {
        key.push(':');
        key.push_str(bucket);
    }
    Ok(key)
}

async fn multicast_trigger(
    State(emulator): State<HubState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HubError> {
    check_project(&emulator, &project_id)?;
    let event: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| Error::MalformedEvent(e.to_string()))?;
    let event_key = multicast_key(&project_id, &headers, &event)?;
    let targets = emulator.multicast_targets(&event_key);
    debug!(event = %event_key, targets = targets.len(), "Multicasting event");

    let content_type = headers.get(CONTENT_TYPE).cloned();
    for trigger_key in targets {
        let url = format!(
            "{}/functions/projects/{}/triggers/{}",
            emulator.hub_url(),
            project_id,
            trigger_key
        );
        let http = emulator.delivery_client().clone();
        let body = body.clone();
        let content_type = content_type.clone();
        tokio::spawn(async move {
            let mut request = http.post(&url).body(body);
            if let Some(content_type) = content_type {
                request = request.header(CONTENT_TYPE, content_type);
            }
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(function = %trigger_key, status = %response.status(), "Multicast delivery failed");
                }
                // Drain the body so the function runs to completion.
                Ok(response) => {
                    if let Err(e) = response.bytes().await {
                        warn!(function = %trigger_key, error = %e, "Multicast delivery interrupted");
                    }
                }
                Err(e) => warn!(function = %trigger_key, error = %e, "Multicast delivery failed"),
            }
        });
    }

    Ok(Json(json!({ "status": "multicast_acknowledged" })))
}

/// Path the runtime sees: everything after `/{project}/{region}/{name}`,
/// plus the query string.
pub fn runtime_path(uri: &Uri) -> String {
    let rest = uri.path().splitn(5, '/').nth(4).unwrap_or("");
    match uri.query() {
        Some(query) => format!("/{}?{}", rest, query),
        None => format!("/{}", rest),
    }
}

async fn https_trigger(
    State(emulator): State<HubState>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Result<Response, HubError> {
    let param = |name: &str| params.get(name).map(String::as_str).unwrap_or_default();
    check_project(&emulator, param("project_id"))?;

    let id = format!("{}-{}", param("region"), param("trigger_name"));
    let Some(record) = emulator.trigger_record(&id) else {
        return Err(HubError::FunctionNotFound {
            id,
            valid: emulator.enabled_trigger_keys(),
        });
    };

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| HubError::BadRequest(format!("Failed to read request body: {}", e)))?;

    let mut headers = parts.headers;
    if needs_callable_auth(&record.def) {
        apply_callable_auth(&mut headers);
    }

    let proxied = ProxyRequest {
        method: parts.method,
        path: runtime_path(&parts.uri),
        headers,
        body,
    };
    debug!(function = %id, path = %proxied.path, "Accepted HTTPS request");
    Ok(emulator.invoke(record, proxied).await?)
}
