//! Generation engine contract.
//!
//! An engine turns a prompt string into a lazy sequence of text fragments.
//! Implementations must stop pulling fragments once the supplied
//! [`CancellationToken`] fires.

mod llama_server;
#[cfg(any(test, feature = "mock"))]
mod mock;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

pub use llama_server::LlamaServerEngine;
#[cfg(any(test, feature = "mock"))]
pub use mock::{RecordedCall, ScriptedEngine};

/// Most stop sequences an engine accepts.
pub const MAX_STOP_SEQUENCES: usize = 4;

/// Fragment stream produced by an engine.
pub type FragmentStream = BoxStream<'static, Result<String, EngineError>>;

/// Sampling and termination parameters for one generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    /// `None` (or zero) means unbounded.
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub seed: Option<u32>,
}

impl GenerationParams {
    /// The positive token bound, if any.
    pub fn token_limit(&self) -> Option<u32> {
        self.max_tokens.filter(|&n| n > 0)
    }

    /// Merge stop sequences: request first, then model defaults, then tool
    /// protocol words.  Duplicates keep their first position, blank entries
    /// are dropped and the result is capped at [`MAX_STOP_SEQUENCES`].
    pub fn assemble_stop_sequences(
        request: &[String],
        model: &[String],
        tool: Option<&[String]>,
    ) -> Vec<String> {
        let mut stop: Vec<String> = Vec::with_capacity(MAX_STOP_SEQUENCES);
        let candidates = request
            .iter()
            .chain(model)
            .chain(tool.into_iter().flatten());
        for word in candidates {
            if stop.len() == MAX_STOP_SEQUENCES {
                break;
            }
            if word.trim().is_empty() || stop.contains(word) {
                continue;
            }
            stop.push(word.clone());
        }
        stop
    }
}

/// Prompt-token count reported by the engine, shared with the stream that
/// fills it in.
#[derive(Debug, Clone, Default)]
pub struct PromptTokens(Arc<AtomicU32>);

impl PromptTokens {
    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// The count reported so far; zero until the engine reports it.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A started generation.
pub struct Generation {
    pub fragments: FragmentStream,
    pub prompt_tokens: PromptTokens,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("prompt_tokens", &self.prompt_tokens.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start generating from `prompt`.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<Generation, EngineError>;
}
