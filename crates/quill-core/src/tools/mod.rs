//! Process-wide tool catalog and the round that executes detected calls.

mod orchestrator;
mod registry;

use std::future::Future;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ToolError;

pub use orchestrator::{CANCELLED, ToolOrchestrator};
pub use registry::ToolRegistry;

/// Parsed tool arguments.
pub type Arguments = Map<String, Value>;

/// Executes one registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Arguments) -> Result<Value, ToolError>;
}

/// A [`ToolHandler`] backed by an async closure.
pub struct FnTool<F> {
    handler: F,
}

/// Wrap an async closure as a [`ToolHandler`].
///
/// ```
/// use quill_core::tools::tool_fn;
/// use serde_json::json;
///
/// let echo = tool_fn(|args| async move { Ok(json!(args)) });
/// # let _ = echo;
/// ```
pub fn tool_fn<F, Fut>(handler: F) -> FnTool<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    FnTool { handler }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, arguments: Arguments) -> Result<Value, ToolError> {
        (self.handler)(arguments).await
    }
}
