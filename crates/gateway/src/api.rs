//! HTTP surface: stream CRUD, lifecycle actions, status and ONVIF routes.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::onvif::{Document, OnvifResponder, ResponderError, XML_CONTENT_TYPE};
use crate::reconciler;
use crate::store::{StoreError, StreamStore};
use crate::streams::{Stream, StreamCreate, StreamId, StreamStatus, StreamStatusResponse, StreamUpdate};
use crate::supervisor::StreamSupervisor;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StreamStore>,
    pub supervisor: Arc<StreamSupervisor>,
    pub responder: Arc<OnvifResponder>,
}

impl AppState {
    pub fn new(store: Arc<StreamStore>, supervisor: Arc<StreamSupervisor>) -> Self {
        let relay = supervisor.relay_config();
        let responder = OnvifResponder::new(store.clone(), relay.base_port, relay.protocol.clone());
        Self {
            store,
            supervisor,
            responder: Arc::new(responder),
        }
    }
}

/// Errors returned by API handlers, rendered as `{"detail": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Stream not found")]
    NotFound,

    #[error("ONVIF port {0} is already in use")]
    PortInUse(u16),

    #[error("{0}")]
    OperationFailed(&'static str),

    /// Storage failure. Only `detail` reaches the client; `source` is logged.
    #[error("{detail}")]
    Store {
        detail: &'static str,
        source: StoreError,
    },
}

impl ApiError {
    /// Map a store error, hiding storage internals behind `detail`.
    fn from_store(detail: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |e| match e {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::PortInUse(port) => ApiError::PortInUse(port),
            source => ApiError::Store { detail, source },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PortInUse(_) => StatusCode::BAD_REQUEST,
            ApiError::OperationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store { detail, source } => {
                error!(error = %source, "{}", detail);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl IntoResponse for Document {
    fn into_response(self) -> Response {
        let status = if self.fault {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        (status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

impl IntoResponse for ResponderError {
    fn into_response(self) -> Response {
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, XML_CONTENT_TYPE)],
            "<error>Stream not found</error>",
        )
            .into_response()
    }
}

fn host_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::HOST).and_then(|v| v.to_str().ok())
}

async fn find_stream(state: &AppState, id: StreamId) -> Result<Stream, ApiError> {
    state.store.get(id).await.ok_or(ApiError::NotFound)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "cam-gateway" }))
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<Stream>> {
    Json(state.store.list().await)
}

async fn create_stream(
    State(state): State<AppState>,
    Json(data): Json<StreamCreate>,
) -> Result<(StatusCode, Json<Stream>), ApiError> {
    let stream = state
        .store
        .create(data)
        .await
        .map_err(ApiError::from_store("Failed to create stream"))?;
    info!(stream_id = stream.id, name = %stream.name, "Created stream");

    if stream.enabled && !state.supervisor.start(&stream).await {
        warn!(stream_id = stream.id, "Created stream could not be started");
    }

    Ok((StatusCode::CREATED, Json(stream)))
}

async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> Result<Json<Stream>, ApiError> {
    Ok(Json(find_stream(&state, id).await?))
}

async fn update_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
    Json(update): Json<StreamUpdate>,
) -> Result<Json<Stream>, ApiError> {
    let stream = state
        .store
        .update(id, update)
        .await
        .map_err(ApiError::from_store("Failed to update stream"))?;

    // Pick up the new settings.
    state.supervisor.stop(id).await;
    if stream.enabled && !state.supervisor.start(&stream).await {
        warn!(stream_id = id, "Updated stream could not be started");
    }

    info!(stream_id = id, name = %stream.name, "Updated stream");
    Ok(Json(stream))
}

async fn delete_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> Result<StatusCode, ApiError> {
    find_stream(&state, id).await?;

    if !state.supervisor.stop(id).await {
        return Err(ApiError::OperationFailed("Failed to delete stream"));
    }
    let stream = state
        .store
        .delete(id)
        .await
        .map_err(ApiError::from_store("Failed to delete stream"))?;
    state.supervisor.forget(id).await;

    info!(stream_id = id, name = %stream.name, "Deleted stream");
    Ok(StatusCode::NO_CONTENT)
}

async fn start_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stream = find_stream(&state, id).await?;
    if state.supervisor.start(&stream).await {
        Ok(Json(json!({ "message": format!("Stream {} started successfully", id) })))
    } else {
        Err(ApiError::OperationFailed("Failed to start stream"))
    }
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    find_stream(&state, id).await?;
    if state.supervisor.stop(id).await {
        Ok(Json(json!({ "message": format!("Stream {} stopped successfully", id) })))
    } else {
        Err(ApiError::OperationFailed("Failed to stop stream"))
    }
}

async fn restart_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stream = find_stream(&state, id).await?;
    if state.supervisor.restart(&stream).await {
        Ok(Json(json!({ "message": format!("Stream {} restarted successfully", id) })))
    } else {
        Err(ApiError::OperationFailed("Failed to restart stream"))
    }
}

async fn stream_status(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> Result<Json<StreamStatusResponse>, ApiError> {
    let stream = find_stream(&state, id).await?;
    Ok(Json(reconciler::refresh(&state.supervisor, &stream).await))
}

async fn all_statuses(State(state): State<AppState>) -> Json<BTreeMap<StreamId, StreamStatus>> {
    Json(state.supervisor.all_statuses().await)
}

async fn onvif_device(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
    headers: HeaderMap,
) -> Result<Document, ResponderError> {
    state.responder.device_descriptor(id, host_header(&headers)).await
}

async fn onvif_media_wsdl(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
    headers: HeaderMap,
) -> Document {
    state.responder.media_descriptor(id, host_header(&headers))
}

async fn onvif_media(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Document, ResponderError> {
    let body = String::from_utf8_lossy(&body);
    state
        .responder
        .media_query(id, &body, host_header(&headers))
        .await
}

async fn onvif_stream(
    State(state): State<AppState>,
    Path(id): Path<StreamId>,
) -> Result<Document, ResponderError> {
    state.responder.stream_redirect(id).await
}

/// Build the full application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/streams", get(list_streams).post(create_stream))
        .route(
            "/api/streams/:id",
            get(get_stream).put(update_stream).delete(delete_stream),
        )
        .route("/api/streams/:id/start", post(start_stream))
        .route("/api/streams/:id/stop", post(stop_stream))
        .route("/api/streams/:id/restart", post(restart_stream))
        .route("/api/streams/:id/status", get(stream_status))
        .route("/api/status", get(all_statuses))
        .route("/onvif/:id/device.xml", get(onvif_device))
        .route("/onvif/:id/media.wsdl", get(onvif_media_wsdl))
        .route("/onvif/:id/media", post(onvif_media))
        .route("/onvif/:id/stream", get(onvif_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
