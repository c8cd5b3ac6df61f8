//! Raw prompt completions (`POST /v1/completions`, `POST /completions` and the
//! Azure-style deployment path).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use quill_core::openai::{CompletionChoice, CompletionRequest, CompletionResponse};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use utoipa::OpenApi;

use super::{sse_response, validate_sampling};
use crate::error::ServerError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(completions, deployment_completions),
    components(schemas(CompletionRequest, CompletionResponse, CompletionChoice))
)]
pub struct CompletionsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/completions", post(completions))
}

pub fn deployment_router() -> Router<Arc<AppState>> {
    Router::new().route("/openai/deployments/{model}/completions", post(deployment_completions))
}

/// The prompt is sent to the engine verbatim; no chat template and no tool
/// protocol are applied.
#[utoipa::path(
    post,
    path = "/v1/completions",
    tag = "completions",
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = CompletionResponse),
        (status = 400, description = "Empty prompt"),
        (status = 502, description = "Generation engine error"),
    )
)]
pub async fn completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, ServerError> {
    respond(&state, request).await
}

#[utoipa::path(
    post,
    path = "/openai/deployments/{model}/completions",
    tag = "completions",
    params(("model" = String, Path, description = "Model profile; overrides the body's `model`")),
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = CompletionResponse),
        (status = 400, description = "Empty prompt"),
        (status = 502, description = "Generation engine error"),
    )
)]
pub async fn deployment_completions(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(mut request): Json<CompletionRequest>,
) -> Result<Response, ServerError> {
    request.model = model;
    respond(&state, request).await
}

async fn respond(state: &AppState, request: CompletionRequest) -> Result<Response, ServerError> {
    validate_sampling(&request.sampling)?;
    let service = state
        .service(&request.model)
        .ok_or_else(|| ServerError::NotFound("no model configured".into()))?;
    debug!(
        model = %request.model,
        prompt_len = request.prompt.len(),
        stream = request.stream,
        "completion request"
    );

    let cancel = CancellationToken::new();
    if request.stream {
        let frames = service.complete_stream(request, cancel.clone())?;
        return Ok(sse_response(frames, cancel));
    }

    let _guard = cancel.clone().drop_guard();
    let response = service.complete(request, cancel).await?;
    Ok(Json(response).into_response())
}
