//! Liveness endpoint reporting the configured models and tool catalog.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health), components(schemas(HealthStatus)))]
pub struct HealthApi;

/// Body of `GET /health`.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    /// Model profile names, in settings order.
    pub models: Vec<String>,
    /// Number of tools executable server-side.
    pub tools: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Always 200 once startup validation has passed; a server with a broken
/// settings file never gets this far.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is up", body = HealthStatus)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        models: state
            .services()
            .iter()
            .map(|service| service.profile().name.clone())
            .collect(),
        tools: state.registry.len(),
    })
}
