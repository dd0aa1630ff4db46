//! Axum route handlers for the fleet gateway API.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    declaration::{DestroyVolumesBody, FleetDeclaration},
    error::GatewayError,
    state::AppState,
};

/// Response header carrying the id every log line of the operation is tagged with.
pub const OPERATION_HEADER: &str = "x-operation-id";

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router over the given provider state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/fleet/up", post(fleet_up))
        .route("/v1/fleet/delete", post(fleet_delete))
        .route("/v1/fleet/instances", post(fleet_instances))
        .route("/v1/fleet/image", post(fleet_image))
        .route("/v1/volumes/destroy", post(destroy_volumes))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn operation_span(op: &'static str, operation: Uuid, environment: &str) -> tracing::Span {
    tracing::info_span!("fleet_op", op, %operation, environment)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health` — liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `POST /v1/fleet/up` — create or start every declared VM.
///
/// # Errors
/// Returns 400 for an invalid declaration and 500 when the provider fails.
pub async fn fleet_up(
    State(state): State<AppState>,
    Json(body): Json<FleetDeclaration>,
) -> Result<impl IntoResponse, GatewayError> {
    let operation = Uuid::new_v4();
    let span = operation_span("up", operation, &body.environment);
    let fleet = state.fleet(body.validate()?);
    let report = fleet.up().instrument(span).await?;
    Ok(([(OPERATION_HEADER, operation.to_string())], Json(report)))
}

/// `POST /v1/fleet/delete` — destroy every VM and the environment network.
///
/// # Errors
/// Returns 400 for an invalid declaration and 500 when the provider fails.
pub async fn fleet_delete(
    State(state): State<AppState>,
    Json(body): Json<FleetDeclaration>,
) -> Result<impl IntoResponse, GatewayError> {
    let operation = Uuid::new_v4();
    let span = operation_span("delete", operation, &body.environment);
    let fleet = state.fleet(body.validate()?);
    fleet.delete().instrument(span).await?;
    Ok((StatusCode::NO_CONTENT, [(OPERATION_HEADER, operation.to_string())]))
}

/// `POST /v1/fleet/instances` — report the current state of every VM.
///
/// # Errors
/// Returns 400 for an invalid declaration and 500 when the provider fails.
pub async fn fleet_instances(
    State(state): State<AppState>,
    Json(body): Json<FleetDeclaration>,
) -> Result<impl IntoResponse, GatewayError> {
    let operation = Uuid::new_v4();
    let span = operation_span("instances", operation, &body.environment);
    let fleet = state.fleet(body.validate()?);
    let infos = fleet.instance_infos().instrument(span).await?;
    Ok(([(OPERATION_HEADER, operation.to_string())], Json(infos)))
}

/// `POST /v1/fleet/image` — export the disk of every running VM.
///
/// # Errors
/// Returns 400 for an invalid declaration and 500 when the provider fails.
pub async fn fleet_image(
    State(state): State<AppState>,
    Json(body): Json<FleetDeclaration>,
) -> Result<impl IntoResponse, GatewayError> {
    let operation = Uuid::new_v4();
    let span = operation_span("image", operation, &body.environment);
    let fleet = state.fleet(body.validate()?);
    let exported = fleet.image().instrument(span).await?;
    tracing::info!(%operation, count = exported.len(), "exported disks");
    Ok((StatusCode::NO_CONTENT, [(OPERATION_HEADER, operation.to_string())]))
}

/// `POST /v1/volumes/destroy` — delete the backing files of named volumes.
///
/// # Errors
/// Returns 400 for an invalid body and 500 when the provider fails.
pub async fn destroy_volumes(
    State(state): State<AppState>,
    Json(body): Json<DestroyVolumesBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let operation = Uuid::new_v4();
    let span = operation_span("destroy_volumes", operation, &body.environment);
    let (declaration, names) = body.validate()?;
    state
        .fleet(declaration)
        .destroy_volumes(&names)
        .instrument(span)
        .await?;
    Ok((StatusCode::NO_CONTENT, [(OPERATION_HEADER, operation.to_string())]))
}
