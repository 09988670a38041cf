//! HTTP handlers for the Roomcast server.
//!
//! Room CRUD runs against the in-memory directory; the `/ws` route upgrades
//! the request and hands the raw stream to the room's hub.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::rooms::{RoomDirectory, RoomRecord};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use roomcast_core::{Registry, RegistryError, RoomId};
use roomcast_transport::{
    accept_key, join_room, ConnectionConfig, HandshakeError, Joined, TransportError,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live room hubs.
    pub registry: Registry,
    /// Created rooms.
    pub directory: RoomDirectory,
    /// Settings for every new connection.
    pub connection: ConnectionConfig,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            registry: Registry::with_config(config.registry_config()),
            directory: RoomDirectory::new(),
            connection: config.connection_config(),
            config,
        }
    }
}

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The path did not contain a valid room ID.
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    /// No such room.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// The WebSocket upgrade was refused.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The room could not be created.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidRoomId(_) => StatusCode::BAD_REQUEST,
            Self::RoomNotFound(_) => StatusCode::NOT_FOUND,
            Self::Handshake(e) => e.status(),
            Self::Registry(RegistryError::RoomLimitReached(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Registry(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct CreatedRoom {
    id: RoomId,
    location: String,
}

#[derive(Debug, Serialize)]
struct RoomInfo {
    id: RoomId,
    created_at: u64,
    live: bool,
    members: usize,
}

#[derive(Debug, Serialize)]
struct RoomList {
    length: usize,
    rooms: Vec<RoomInfo>,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/:id", get(get_room).delete(delete_room))
        .route("/rooms/:id/ws", get(ws_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Roomcast server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/rooms/{{id}}/ws", addr);

    let state = Arc::new(AppState::new(config));
    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then close every room.
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped, closing rooms");
    state.registry.close_all().await;
    metrics::set_active_rooms(0);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn create_room(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let max_rooms = state.config.limits.max_rooms;
    if state.directory.len() >= max_rooms {
        return Err(RegistryError::RoomLimitReached(max_rooms).into());
    }

    let record = state.directory.create();
    metrics::record_room_created();
    info!(room = %record.id, "Room created");

    let location = format!("/rooms/{}", record.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location.clone())],
        Json(CreatedRoom {
            id: record.id,
            location,
        }),
    ))
}

async fn list_rooms(State(state): State<Arc<AppState>>) -> Json<RoomList> {
    let mut rooms = Vec::new();
    for record in state.directory.list() {
        rooms.push(room_info(&state, record).await);
    }

    Json(RoomList {
        length: rooms.len(),
        rooms,
    })
}

async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RoomInfo>, ApiError> {
    let room = parse_room_id(&id)?;
    let record = state.directory.get(room).ok_or(ApiError::RoomNotFound(room))?;
    Ok(Json(room_info(&state, record).await))
}

async fn delete_room(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let room = parse_room_id(&id)?;
    state
        .directory
        .remove(room)
        .ok_or(ApiError::RoomNotFound(room))?;

    let was_live = state.registry.delete(room).await;
    metrics::set_active_rooms(state.registry.len());
    info!(room = %room, was_live, "Room deleted");

    Ok(StatusCode::NO_CONTENT)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    mut request: Request,
) -> Result<Response, ApiError> {
    let room = parse_room_id(&id)?;
    if state.directory.get(room).is_none() {
        return Err(ApiError::RoomNotFound(room));
    }

    let accept = accept_key(request.method(), request.headers()).map_err(|e| {
        warn!(room = %room, error = %e, "Rejected WebSocket upgrade");
        metrics::record_handshake_failure(handshake_reason(&e));
        e
    })?;
    if request.extensions().get::<OnUpgrade>().is_none() {
        metrics::record_handshake_failure(handshake_reason(&HandshakeError::NotUpgradable));
        return Err(HandshakeError::NotUpgradable.into());
    }
    let on_upgrade = hyper::upgrade::on(&mut request);

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Body::empty())
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => handle_connection(state, room, TokioIo::new(upgraded)).await,
            Err(e) => {
                warn!(room = %room, error = %e, "WebSocket upgrade failed");
                metrics::record_handshake_failure("upgrade");
            }
        }
    });

    Ok(response)
}

/// Join an upgraded stream to its room and wait for it to disconnect.
async fn handle_connection<S>(state: Arc<AppState>, room: RoomId, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // The room may have been deleted while the upgrade was in flight
    if state.directory.get(room).is_none() {
        debug!(room = %room, "Room deleted before join, dropping connection");
        return;
    }

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let Joined { id, task, .. } =
        match join_room(&state.registry, room, stream, &state.connection).await {
            Ok(joined) => joined,
            Err(e) => {
                warn!(room = %room, error = %e, "Failed to join room");
                metrics::record_error(error_kind(&e));
                return;
            }
        };

    // A delete that ran during the join removed the directory entry before
    // this hub existed, so tear the hub down here
    if state.directory.get(room).is_none() {
        debug!(room = %room, connection = %id, "Room deleted during join");
        state.registry.delete(room).await;
    }
    metrics::set_active_rooms(state.registry.len());
    debug!(room = %room, connection = %id, "WebSocket connected");

    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => metrics::record_error(error_kind(&e)),
        Err(e) => error!(room = %room, connection = %id, error = %e, "Connection task failed"),
    }

    debug!(room = %room, connection = %id, "WebSocket disconnected");
}

async fn room_info(state: &AppState, record: RoomRecord) -> RoomInfo {
    let hub = state.registry.load(record.id);
    let members = match &hub {
        Some(hub) => hub.member_count().await.unwrap_or(0),
        None => 0,
    };

    RoomInfo {
        id: record.id,
        created_at: record.created_at,
        live: hub.is_some_and(|hub| !hub.is_closed()),
        members,
    }
}

fn parse_room_id(id: &str) -> Result<RoomId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::InvalidRoomId(id.to_string()))
}

fn handshake_reason(error: &HandshakeError) -> &'static str {
    match error {
        HandshakeError::MethodNotAllowed => "method",
        HandshakeError::MissingUpgrade => "upgrade_header",
        HandshakeError::MissingConnectionUpgrade => "connection_header",
        HandshakeError::UnsupportedVersion => "version",
        HandshakeError::InvalidKey => "key",
        HandshakeError::NotUpgradable => "not_upgradable",
    }
}

fn error_kind(error: &TransportError) -> &'static str {
    match error {
        TransportError::ConnectionClosed => "connection_closed",
        TransportError::DeadlineExceeded(_) => "deadline",
        TransportError::Protocol(_) => "protocol",
        TransportError::Io(_) => "io",
        TransportError::Hub(_) => "hub",
        TransportError::Registry(_) => "registry",
    }
}
