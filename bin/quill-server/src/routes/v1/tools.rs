//! Registered tool catalog (`GET /v1/tools`).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use quill_core::openai::ToolSpec;
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};

use crate::state::AppState;

/// Tools the server executes itself, in the request `tools` layout.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ToolList {
    /// Always `"list"`.
    pub object: String,
    pub data: Vec<ToolSpec>,
}

#[derive(OpenApi)]
#[openapi(paths(list_tools), components(schemas(ToolList)))]
pub struct ToolsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/tools", get(list_tools))
}

#[utoipa::path(
    get,
    path = "/v1/tools",
    tag = "tools",
    responses((status = 200, description = "Registered tools", body = ToolList))
)]
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ToolList> {
    Json(ToolList {
        object: "list".into(),
        data: state
            .registry
            .declarations()
            .into_iter()
            .map(ToolSpec::from)
            .collect(),
    })
}
