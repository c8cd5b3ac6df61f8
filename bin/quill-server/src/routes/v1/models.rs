//! Model listing (`GET /v1/models`).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use quill_core::openai::{ModelCard, ModelList, unix_now};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models), components(schemas(ModelList, ModelCard)))]
pub struct ModelsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// Configured model profiles, in settings order.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses((status = 200, description = "Configured models", body = ModelList))
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let created = unix_now();
    let data = state
        .services()
        .iter()
        .map(|service| {
            let profile = service.profile();
            ModelCard {
                id: profile.name.clone(),
                object: "model".into(),
                created,
                owned_by: "quill".into(),
                description: profile.description.clone(),
            }
        })
        .collect();
    Json(ModelList {
        object: "list".into(),
        data,
    })
}
