use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check endpoint
#[tracing::instrument]
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub roles: usize,
    pub bindings: usize,
}

/// Readiness endpoint; reports the size of the loaded policy
#[tracing::instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ReadinessResponse {
        status: "ready",
        roles: state.policy.role_count(),
        bindings: state.policy.binding_count(),
    })
}
