// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP/WebSocket gateway for the Terraplane platform.
//!
//! The gateway abstracts the stateful platform behind one uniform API:
//! plugin discovery, computation dispatch, a push stream of lifecycle
//! events, and artifact retrieval. All connections (broker, stores,
//! sender) are constructed at startup and live in [`AppState`]; there
//! are no hidden globals.

#![deny(unsafe_code)]

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path as AxPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tp_broker::Broker;
use tp_core::{AoiFeature, ComputationState, PluginInfo, LIBRARY_VERSION};
use tp_error::{ErrorCode, PlatformError};
use tp_object_store::{ArtifactStorage, DEFAULT_URL_TTL};
use tp_sender::Sender;
use tp_store::ComputationStore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the gateway handlers need, constructed at startup.
pub struct AppState {
    /// Dispatch API.
    pub sender: Sender,
    /// Event fan-out and worker registry.
    pub broker: Arc<dyn Broker>,
    /// Canonical lifecycle records.
    pub store: Arc<dyn ComputationStore>,
    /// Artifact blobs.
    pub storage: Arc<dyn ArtifactStorage>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Structured API error returned on failure.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Create an error with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        let status = match err.code {
            ErrorCode::InfoNotReceived => StatusCode::NOT_FOUND,
            ErrorCode::InputValidation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::VersionMismatch => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /plugin/{id}`: the computation parameters plus the
/// area of interest to run over.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComputeRequest {
    /// Target area of interest.
    pub aoi: AoiFeature,
    /// Plugin parameters; their schema comes from the plugin info.
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ComputationQuery {
    correlation_uuid: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    file_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the gateway router with all routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/plugin", get(cmd_list_plugins))
        .route("/plugin/{id}", get(cmd_get_plugin))
        .route("/plugin/{id}", post(cmd_compute))
        .route("/computation", get(cmd_subscribe))
        .route("/store/{correlation_uuid}", get(cmd_list_artifacts))
        .route("/store/{correlation_uuid}/{store_id}", get(cmd_fetch_artifact))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "library_version": LIBRARY_VERSION,
    }))
}

async fn cmd_list_plugins(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PluginInfo>>, ApiError> {
    let infos = state
        .store
        .list_infos()
        .await
        .map_err(PlatformError::from)?;
    Ok(Json(infos))
}

async fn cmd_get_plugin(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<PluginInfo>, ApiError> {
    match state.sender.request_info(&id, None).await {
        Ok(info) => Ok(Json(info)),
        Err(err) if err.code == ErrorCode::InfoNotReceived => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Plugin {id} does not exist."),
        )),
        Err(err) => Err(err.into()),
    }
}

async fn cmd_compute(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ComputeRequest>,
) -> Result<Json<Uuid>, ApiError> {
    let correlation_uuid = Uuid::new_v4();
    let result = state
        .sender
        .send_compute(
            &id,
            request.aoi,
            request.params,
            correlation_uuid,
            None,
            None,
            None,
        )
        .await;

    match result {
        Ok(handle) => {
            info!(
                plugin = %id,
                user = %correlation_uuid,
                canonical = %handle.canonical_uuid,
                "computation scheduled"
            );
            Ok(Json(correlation_uuid))
        }
        Err(err) if err.code == ErrorCode::InfoNotReceived => {
            // Close the allocated uuid for subscribers before rejecting.
            state
                .broker
                .publish_status(correlation_uuid, ComputationState::Failure, None);
            Err(ApiError::new(
                StatusCode::NOT_FOUND,
                "The plugin is not online.",
            ))
        }
        Err(err) => Err(err.into()),
    }
}

async fn cmd_subscribe(
    upgrade: WebSocketUpgrade,
    Query(query): Query<ComputationQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    // A user-issued uuid may alias a deduplicated computation; events
    // are published under the canonical one.
    let filter = match query.correlation_uuid {
        Some(user_uuid) => Some(
            state
                .store
                .resolve_computation_id(user_uuid)
                .await
                .map_err(PlatformError::from)?
                .unwrap_or(user_uuid),
        ),
        None => None,
    };
    let subscription = state.broker.subscribe(filter);
    Ok(upgrade.on_upgrade(move |socket| forward_events(socket, subscription)))
}

async fn forward_events(mut socket: WebSocket, mut subscription: tp_broker::EventSubscription) {
    while let Some(event) = subscription.recv().await {
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "event frame not serialisable");
                continue;
            }
        };
        if socket.send(Message::Text(frame.into())).await.is_err() {
            debug!("event subscriber disconnected");
            break;
        }
    }
}

async fn cmd_list_artifacts(
    AxPath(correlation_uuid): AxPath<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<tp_core::ArtifactEnriched>>, ApiError> {
    let canonical = state
        .store
        .resolve_computation_id(correlation_uuid)
        .await
        .map_err(PlatformError::from)?
        .unwrap_or(correlation_uuid);
    let artifacts = state
        .storage
        .list_all(canonical)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(artifacts))
}

async fn cmd_fetch_artifact(
    AxPath((correlation_uuid, store_id)): AxPath<(Uuid, String)>,
    Query(query): Query<FetchQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let canonical = state
        .store
        .resolve_computation_id(correlation_uuid)
        .await
        .map_err(PlatformError::from)?
        .unwrap_or(correlation_uuid);

    let dir = tempfile::tempdir()
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let file_name = query.file_name.unwrap_or_else(|| store_id.clone());
    let target = dir.path().join(&file_name);

    let path = state
        .storage
        .fetch(canonical, &store_id, &target)
        .await
        .map_err(|_| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("The requested element {canonical}/{store_id} does not exist!"),
            )
        })?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((
        [(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )],
        bytes,
    )
        .into_response())
}

/// Presign helper exposed for deployments that prefer redirecting to
/// the object store instead of proxying bytes.
pub async fn artifact_url(
    state: &AppState,
    correlation_uuid: Uuid,
    store_id: &str,
) -> Result<String, ApiError> {
    state
        .storage
        .artifact_url(correlation_uuid, store_id, DEFAULT_URL_TTL)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
