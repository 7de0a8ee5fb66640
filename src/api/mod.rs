//! API layer -- axum routes and handlers over the lifecycle manager,
//! orchestrator and analytics engine.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::error::CoreError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Core errors rendered as `{ "error": { "kind", "message" } }`.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            CoreError::ReportNotFound(_) => (StatusCode::NOT_FOUND, "report_not_found"),
            CoreError::ScheduleNotFound(_) => (StatusCode::NOT_FOUND, "schedule_not_found"),
            CoreError::NotRunning { .. } => (StatusCode::CONFLICT, "not_running"),
            CoreError::PersistenceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "persistence_unavailable"),
            CoreError::TriggerEngine { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "trigger_engine"),
        };
        let body = json!({ "error": { "kind": kind, "message": self.0.to_string() } });
        (status, Json(body)).into_response()
    }
}
