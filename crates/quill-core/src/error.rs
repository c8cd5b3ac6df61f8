//! Error types shared across quill-core.
//!
//! Configuration errors are fatal: they are raised before any generation
//! starts and are never retried.  Tool failures never surface here as
//! errors; they are captured per invocation on [`ToolResult`].
//!
//! [`ToolResult`]: crate::types::ToolResult

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration problems (bad settings file, unknown template family,
/// out-of-range protocol index, missing language key, broken pattern).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown template family: {name}")]
    UnknownTemplate { name: String },

    #[error("no tool protocol configured")]
    NoProtocols,

    #[error("tool protocol index {index} out of range ({len} configured)")]
    ProtocolIndexOutOfRange { index: usize, len: usize },

    #[error("tool protocol {index} has no '{lang}' entry in {table}")]
    MissingLanguage {
        index: usize,
        table: &'static str,
        lang: String,
    },

    #[error("tool protocol {index} has an invalid extraction pattern")]
    InvalidPattern {
        index: usize,
        #[source]
        source: regex::Error,
    },

    #[error("no model profile configured")]
    NoModels,

    #[error("failed to read settings file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Failures reported by a [`GenerationEngine`](crate::engine::GenerationEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine request failed")]
    Request(#[from] reqwest::Error),

    #[error("engine returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed engine event: {0}")]
    Decode(String),

    #[cfg(any(test, feature = "mock"))]
    #[error("scripted engine has no response queued")]
    Exhausted,
}

/// Tool registry and handler failures.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool '{0}' is not registered.")]
    NotRegistered(String),

    #[error("Tool '{0}' is already registered.")]
    AlreadyRegistered(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Convenience constructor used by handlers.
    pub fn failed(message: impl Into<String>) -> Self {
        ToolError::Failed(message.into())
    }
}

/// Request-level errors returned by [`ChatService`](crate::service::ChatService).
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("no message in chat history")]
    EmptyConversation,

    #[error("empty prompt")]
    EmptyPrompt,

    /// The caller cancelled the request.  Distinct from both success and
    /// failure: nothing further is emitted to the client.
    #[error("request cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}
