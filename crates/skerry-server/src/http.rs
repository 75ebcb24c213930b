//! HTTP/JSON API.
//!
//! ## Endpoints
//!
//! - `POST /sandboxes` - Create a sandbox
//! - `GET /sandboxes` - List sandboxes
//! - `GET /sandboxes/:id` - Inspect a sandbox
//! - `DELETE /sandboxes/:id` - Delete a sandbox
//! - `GET /orphans` - List unregistered hypervisors
//! - `POST /orphans/purge` - Purge orphans
//! - `GET /health` - Health check

use crate::server::SkerryServer;
use crate::types::{
    CreateSandboxRequest, DeleteSandboxResponse, ErrorResponse, ListOrphansResponse,
    ListSandboxesResponse, PurgeOrphansRequest, PurgeOrphansResponse,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use skerry_core::{CoreError, SandboxSummary};
use tower_http::trace::TraceLayer;

/// A [`CoreError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

/// Status code and error class for `e`.
pub fn classify(e: &CoreError) -> (StatusCode, &'static str) {
    match e {
        CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        CoreError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
        CoreError::Ambiguous { .. } => (StatusCode::CONFLICT, "ambiguous"),
        CoreError::ResourceExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "resource_exhausted"),
        CoreError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = classify(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind, "Request failed");
        } else {
            tracing::debug!(error = %self.0, kind, "Request rejected");
        }
        let body = ErrorResponse {
            kind: kind.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(server: SkerryServer) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/sandboxes", post(create_handler).get(list_handler))
        .route("/sandboxes/:id", get(get_handler).delete(delete_handler))
        .route("/orphans", get(list_orphans_handler))
        .route("/orphans/purge", post(purge_orphans_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "skerry-server"
    }))
}

async fn create_handler(
    State(server): State<SkerryServer>,
    Json(req): Json<CreateSandboxRequest>,
) -> ApiResult<(StatusCode, Json<SandboxSummary>)> {
    let sandbox = server.create(req).await?;
    Ok((StatusCode::CREATED, Json(sandbox.summary())))
}

async fn list_handler(State(server): State<SkerryServer>) -> Json<ListSandboxesResponse> {
    let mut sandboxes: Vec<SandboxSummary> = server
        .service()
        .list()
        .await
        .iter()
        .map(|s| s.summary())
        .collect();
    sandboxes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(ListSandboxesResponse { sandboxes })
}

async fn get_handler(
    State(server): State<SkerryServer>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxSummary>> {
    let sandbox = server.service().get(&id).await?;
    Ok(Json(sandbox.summary()))
}

async fn delete_handler(
    State(server): State<SkerryServer>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteSandboxResponse>> {
    let cleanup_errors = match server.service().delete(&id).await {
        Ok(()) => Vec::new(),
        Err(CoreError::PartialFailure(failures)) => {
            tracing::warn!(sandbox_id = %id, error = %failures, "Sandbox deleted with cleanup errors");
            failures.iter().map(ToString::to_string).collect()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(DeleteSandboxResponse {
        sandbox_id: id,
        cleanup_errors,
    }))
}

async fn list_orphans_handler(State(server): State<SkerryServer>) -> ApiResult<Json<ListOrphansResponse>> {
    let orphans = server.service().list_orphans().await?;
    Ok(Json(ListOrphansResponse { orphans }))
}

async fn purge_orphans_handler(
    State(server): State<SkerryServer>,
    Json(req): Json<PurgeOrphansRequest>,
) -> ApiResult<Json<PurgeOrphansResponse>> {
    let results = server.service().purge_orphans(&req.sandbox_ids).await?;
    Ok(Json(PurgeOrphansResponse { results }))
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    server: SkerryServer,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(server);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
