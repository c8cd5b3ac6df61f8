pub mod chat;
pub mod completions;
pub mod models;
pub mod tools;

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::Router;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use futures::stream::BoxStream;
use quill_core::ChatError;
use quill_core::openai::SamplingOptions;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::state::AppState;

/// Routes served outside `/v1`: the unversioned OpenAI paths and the
/// Azure-style deployment paths.
pub fn root_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(chat::router())
        .merge(completions::router())
        .merge(chat::deployment_router())
        .merge(completions::deployment_router())
}

/// Routes nested under `/v1` (OpenAI-compatible).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(chat::router())
        .merge(completions::router())
        .merge(models::router())
        .merge(tools::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut spec = V1Api::openapi();
    spec.merge(chat::ChatApi::openapi());
    spec.merge(completions::CompletionsApi::openapi());
    spec.merge(models::ModelsApi::openapi());
    spec.merge(tools::ToolsApi::openapi());
    spec
}

/// Reject sampling values outside the OpenAI ranges.
fn validate_sampling(sampling: &SamplingOptions) -> Result<(), ServerError> {
    if let Some(temperature) = sampling.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ServerError::BadRequest(format!(
                "invalid temperature ({temperature}): must be between 0.0 and 2.0"
            )));
        }
    }
    if let Some(top_p) = sampling.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(ServerError::BadRequest(format!(
                "invalid top_p ({top_p}): must be between 0.0 and 1.0"
            )));
        }
    }
    Ok(())
}

/// Render a service stream as SSE: one `data:` frame per item, then
/// `data: [DONE]` once it ends cleanly.
///
/// Errors and cancellation end the response with no further frame.  The
/// token is cancelled when the response body is dropped, which is how a
/// client disconnect reaches the engine and any running tools.
pub(crate) fn sse_response<T>(
    frames: BoxStream<'static, Result<T, ChatError>>,
    cancel: CancellationToken,
) -> Response
where
    T: Serialize + Send + 'static,
{
    let events = stream! {
        let _guard = cancel.drop_guard();
        let mut frames = frames;
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) if e.is_cancelled() => {
                    debug!("stream cancelled");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "stream failed");
                    return;
                }
            };
            match Event::default().json_data(&frame) {
                Ok(event) => yield Ok::<_, Infallible>(event),
                Err(e) => {
                    error!(error = %e, "failed to encode SSE frame");
                    return;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };
    Sse::new(events).into_response()
}
