use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Generation, GenerationEngine, GenerationParams, PromptTokens};
use crate::error::EngineError;

/// Streams completions from a llama.cpp-compatible HTTP server.
#[derive(Debug, Clone)]
pub struct LlamaServerEngine {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    prompt: &'a str,
    n_predict: i64,
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionEvent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    tokens_evaluated: Option<u32>,
}

impl LlamaServerEngine {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl GenerationEngine for LlamaServerEngine {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<Generation, EngineError> {
        let body = CompletionBody {
            prompt,
            n_predict: params.token_limit().map_or(-1, i64::from),
            stop: &params.stop,
            temperature: params.temperature,
            top_p: params.top_p,
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            seed: params.seed,
            stream: true,
        };

        let url = format!("{}/completion", self.base_url);
        debug!(%url, stop = ?params.stop, n_predict = body.n_predict, "starting generation");
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(Generation {
                    fragments: futures::stream::empty().boxed(),
                    prompt_tokens: PromptTokens::default(),
                });
            }
            response = request.send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let prompt_tokens = PromptTokens::default();
        let fragments = event_stream(response.bytes_stream(), cancel, prompt_tokens.clone());

        Ok(Generation {
            fragments: Box::pin(fragments),
            prompt_tokens,
        })
    }
}

/// Longest SSE line accepted from the engine before the stream is failed.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Fragments carried by the server's SSE events, until a `stop` event, the
/// end of the body or cancellation.
fn event_stream<S, B, E>(
    chunks: S,
    cancel: CancellationToken,
    prompt_tokens: PromptTokens,
) -> impl Stream<Item = Result<String, EngineError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
    EngineError: From<E>,
{
    try_stream! {
        let mut events = Box::pin(cap_line_length(chunks, MAX_LINE_BYTES).eventsource());
        'read: loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break 'read,
                next = events.next() => next,
            };
            let Some(event) = next else { break 'read };
            let event = event.map_err(stream_error)?;
            let Some(event) = parse_data(&event.data)? else { continue };
            if let Some(n) = event.tokens_evaluated {
                prompt_tokens.set(n);
            }
            if !event.content.is_empty() {
                trace!(fragment = %event.content, "engine fragment");
                yield event.content;
            }
            if event.stop {
                break 'read;
            }
        }
    }
}

/// Fails the byte stream once a single line grows past `max` bytes.
fn cap_line_length<S, B, E>(
    chunks: S,
    max: usize,
) -> impl Stream<Item = Result<B, EngineError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    EngineError: From<E>,
{
    let mut line_len = 0usize;
    chunks.map(move |chunk| -> Result<B, EngineError> {
        let chunk = chunk?;
        let bytes = chunk.as_ref();
        line_len = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(pos) => bytes.len() - pos - 1,
            None => line_len + bytes.len(),
        };
        if line_len > max {
            return Err(EngineError::Decode(format!("SSE line exceeds {max} bytes")));
        }
        Ok(chunk)
    })
}

fn stream_error(e: EventStreamError<EngineError>) -> EngineError {
    match e {
        EventStreamError::Transport(e) => e,
        other => EngineError::Decode(other.to_string()),
    }
}

/// Decode the data field of one SSE event.  Empty payloads and the
/// `[DONE]` sentinel yield `None`.
fn parse_data(data: &str) -> Result<Option<CompletionEvent>, EngineError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    serde_json::from_str(data)
        .map(Some)
        .map_err(|e| EngineError::Decode(format!("{e}: {data}")))
}
