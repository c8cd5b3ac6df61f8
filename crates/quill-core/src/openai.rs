//! OpenAI-compatible request and response types.
//!
//! These structures follow the OpenAI REST schema so that existing OpenAI
//! SDK clients work without modification.  Chunk `finish_reason` is always
//! serialised, as `null` until the terminal chunk.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::engine::GenerationParams;
use crate::types::{FinishReason, FunctionCall, Message, Role, ToolDeclaration, ToolInvocation};

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn new_chat_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn new_completion_id() -> String {
    format!("cmpl-{}", uuid::Uuid::new_v4().simple())
}

// ── Shared ───────────────────────────────────────────────────────────────────

/// `stop` accepts a single string or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum StopField {
    One(String),
    Many(Vec<String>),
}

impl StopField {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopField::One(s) => vec![s.clone()],
            StopField::Many(v) => v.clone(),
        }
    }
}

/// Sampling fields common to chat and raw completion requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SamplingOptions {
    /// Maximum tokens to generate; absent or zero means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopField>,
}

impl SamplingOptions {
    pub fn request_stops(&self) -> Vec<String> {
        self.stop.as_ref().map(StopField::to_vec).unwrap_or_default()
    }

    /// Engine parameters with an already assembled stop list.
    pub fn to_params(&self, stop: Vec<String>) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            stop,
            temperature: self.temperature,
            top_p: self.top_p,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            seed: self.seed,
        }
    }
}

/// Token accounting of a non-streaming response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

// ── Chat Completions ─────────────────────────────────────────────────────────

/// A tool offered to the model in a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolSpec {
    /// Always `"function"`.
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ToolDeclaration,
}

fn function_kind() -> String {
    "function".to_owned()
}

impl From<ToolDeclaration> for ToolSpec {
    fn from(function: ToolDeclaration) -> Self {
        Self {
            kind: function_kind(),
            function,
        }
    }
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// Model profile name; unknown names select the first profile.
    #[serde(default)]
    pub model: String,
    pub messages: Vec<Message>,
    /// When `true`, the response is streamed using SSE.
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    /// `"none"`, `"auto"`, `"parallel"` or an OpenAI tool-choice object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            sampling: SamplingOptions::default(),
            tools: None,
            tool_choice: None,
            user: None,
        }
    }

    /// Declarations of the tools offered in this request.
    pub fn tool_declarations(&self) -> Vec<ToolDeclaration> {
        self.tools
            .iter()
            .flatten()
            .map(|spec| spec.function.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: FinishReason,
}

/// Response body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionResponse {
    pub id: String,
    /// Always `"chat.completion"`.
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub fn new(model: impl Into<String>, message: Message, finish_reason: FinishReason, usage: Usage) -> Self {
        Self {
            id: new_chat_id(),
            object: "chat.completion".into(),
            created: unix_now(),
            model: model.into(),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        }
    }
}

/// A tool call inside a streamed delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeltaToolCall {
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// Partial message carried by a chunk.  All-`None` serialises as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChunkChoice {
    /// Position of this chunk in the stream: 0 for the role announcement,
    /// then one more per emitted chunk.
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

/// One SSE frame of a streamed chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionChunk {
    pub id: String,
    /// Always `"chat.completion.chunk"`.
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    pub fn choice(&self) -> Option<&ChunkChoice> {
        self.choices.first()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choice().and_then(|c| c.finish_reason)
    }

    pub fn content(&self) -> Option<&str> {
        self.choice().and_then(|c| c.delta.content.as_deref())
    }
}

/// Stamps chunks of one streamed response with a shared id, creation time and
/// model name, and numbers them.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    id: String,
    created: i64,
    model: String,
    next_index: u32,
}

impl ChunkBuilder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: new_chat_id(),
            created: unix_now(),
            model: model.into(),
            next_index: 0,
        }
    }

    fn build(&mut self, delta: Delta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        let index = self.next_index;
        self.next_index += 1;
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index,
                delta,
                finish_reason,
            }],
        }
    }

    /// The opening chunk announcing the assistant role.
    pub fn role(&mut self) -> ChatCompletionChunk {
        self.build(
            Delta {
                role: Some(Role::Assistant),
                ..Default::default()
            },
            None,
        )
    }

    pub fn content(&mut self, text: String) -> ChatCompletionChunk {
        self.build(
            Delta {
                content: Some(text),
                ..Default::default()
            },
            None,
        )
    }

    /// A terminal chunk carrying tool calls and an optional message.
    pub fn tool_calls(&mut self, calls: &[ToolInvocation], content: Option<String>) -> ChatCompletionChunk {
        let tool_calls = calls
            .iter()
            .enumerate()
            .map(|(index, call)| DeltaToolCall {
                index: index as u32,
                id: call.id.clone(),
                kind: call.kind.clone(),
                function: call.function.clone(),
            })
            .collect();
        self.build(
            Delta {
                role: Some(Role::Assistant),
                content,
                tool_calls: Some(tool_calls),
            },
            Some(FinishReason::ToolCalls),
        )
    }

    /// A terminal chunk with an empty delta.
    pub fn finish(&mut self, reason: FinishReason) -> ChatCompletionChunk {
        self.build(Delta::default(), Some(reason))
    }
}

// ── Completions ──────────────────────────────────────────────────────────────

/// Request body for `POST /v1/completions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CompletionChoice {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub finish_reason: Option<FinishReason>,
}

/// Response body (and stream frame) for `POST /v1/completions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CompletionResponse {
    pub id: String,
    /// Always `"text_completion"`.
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    pub fn new(id: &str, created: i64, model: &str, choice: CompletionChoice) -> Self {
        Self {
            id: id.to_owned(),
            object: "text_completion".into(),
            created,
            model: model.to_owned(),
            choices: vec![choice],
            usage: None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.text.as_deref())
    }
}

// ── Models list ──────────────────────────────────────────────────────────────

/// A single model descriptor (OpenAI `/v1/models` format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ModelCard {
    pub id: String,
    /// Always `"model"`.
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Response body for `GET /v1/models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ModelList {
    /// Always `"list"`.
    pub object: String,
    pub data: Vec<ModelCard>,
}
