//! OpenAI-compatible chat-completion routes.
//!
//! The request's `model` picks a configured profile (unknown names fall back
//! to the first one).  On the deployment path the `{model}` segment takes
//! its place.  Tool calls made by the model are either executed
//! against the registry and answered in a second generation, or handed back
//! to the caller with `finish_reason = "tool_calls"`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use quill_core::openai::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkChoice,
    Delta, DeltaToolCall, ToolSpec, Usage,
};
use quill_core::types::{FinishReason, FunctionCall, Message, Role, ToolDeclaration, ToolInvocation};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use utoipa::OpenApi;

use super::{sse_response, validate_sampling};
use crate::error::ServerError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(chat_completions, deployment_chat_completions),
    components(schemas(
        ChatCompletionRequest,
        ChatCompletionResponse,
        ChatCompletionChunk,
        ChatChoice,
        ChunkChoice,
        Delta,
        DeltaToolCall,
        Message,
        Role,
        ToolSpec,
        ToolDeclaration,
        ToolInvocation,
        FunctionCall,
        FinishReason,
        Usage
    ))
)]
pub struct ChatApi;

/// Register chat-completion routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// Azure-style route, served at the root only.
pub fn deployment_router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/openai/deployments/{model}/chat/completions",
        post(deployment_chat_completions),
    )
}

/// OpenAI chat completions (`POST /v1/chat/completions`).
///
/// When `stream: true`, the response is streamed chunk-by-chunk using SSE
/// and terminated by `data: [DONE]`.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Empty conversation"),
        (status = 500, description = "Configuration error"),
        (status = 502, description = "Generation engine error"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ServerError> {
    respond(&state, request).await
}

/// Chat completions for the deployment named in the path.
#[utoipa::path(
    post,
    path = "/openai/deployments/{model}/chat/completions",
    tag = "chat",
    params(("model" = String, Path, description = "Model profile; overrides the body's `model`")),
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Empty conversation"),
        (status = 502, description = "Generation engine error"),
    )
)]
pub async fn deployment_chat_completions(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    Json(mut request): Json<ChatCompletionRequest>,
) -> Result<Response, ServerError> {
    request.model = model;
    respond(&state, request).await
}

async fn respond(state: &AppState, request: ChatCompletionRequest) -> Result<Response, ServerError> {
    validate_sampling(&request.sampling)?;
    let service = state
        .service(&request.model)
        .ok_or_else(|| ServerError::NotFound("no model configured".into()))?;
    debug!(
        model = %request.model,
        profile = %service.profile().name,
        messages = request.messages.len(),
        tools = request.tools.as_ref().map_or(0, Vec::len),
        stream = request.stream,
        "chat completion request"
    );

    let cancel = CancellationToken::new();
    if request.stream {
        let chunks = service.chat_stream(request, cancel.clone())?;
        return Ok(sse_response(chunks, cancel));
    }

    // Dropped with this future when the client goes away.
    let _guard = cancel.clone().drop_guard();
    let response = service.chat(request, cancel).await?;
    Ok(Json(response).into_response())
}
