//! Queue-based fake engine for tests.
//!
//! Each call to [`GenerationEngine::generate`] pops the next script from the
//! front of the queue and replays its fragments.  Every prompt and parameter
//! set is recorded for later assertions.  An empty queue yields
//! [`EngineError::Exhausted`].

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{Generation, GenerationEngine, GenerationParams, PromptTokens};
use crate::error::EngineError;

/// One recorded `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub prompt: String,
    pub params: GenerationParams,
}

#[derive(Debug, Clone)]
enum Script {
    Fragments {
        fragments: Vec<String>,
        prompt_tokens: u32,
        /// Keep the stream open after the last fragment until cancelled.
        hang: bool,
        /// Fail with a decode error after the last fragment.
        fail_with: Option<String>,
    },
    Status {
        status: u16,
        body: String,
    },
}

#[derive(Debug, Default)]
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, script: Script) -> &Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(script);
        self
    }

    /// Queue a generation that yields `fragments` and then ends.
    pub fn queue<S: AsRef<str>>(&self, fragments: &[S]) -> &Self {
        self.queue_with_prompt_tokens(fragments, 0)
    }

    /// Like [`queue`](Self::queue), reporting `prompt_tokens` once the
    /// fragments are exhausted.
    pub fn queue_with_prompt_tokens<S: AsRef<str>>(
        &self,
        fragments: &[S],
        prompt_tokens: u32,
    ) -> &Self {
        self.push(Script::Fragments {
            fragments: to_owned(fragments),
            prompt_tokens,
            hang: false,
            fail_with: None,
        })
    }

    /// Queue a generation that yields `fragments` and then stays open until
    /// its cancellation token fires.
    pub fn queue_hanging<S: AsRef<str>>(&self, fragments: &[S]) -> &Self {
        self.push(Script::Fragments {
            fragments: to_owned(fragments),
            prompt_tokens: 0,
            hang: true,
            fail_with: None,
        })
    }

    /// Queue a generation that yields `fragments` and then fails mid-stream.
    pub fn queue_stream_error<S: AsRef<str>>(&self, fragments: &[S], message: &str) -> &Self {
        self.push(Script::Fragments {
            fragments: to_owned(fragments),
            prompt_tokens: 0,
            hang: false,
            fail_with: Some(message.to_owned()),
        })
    }

    /// Queue a generation that is rejected before streaming starts.
    pub fn queue_status(&self, status: u16, body: &str) -> &Self {
        self.push(Script::Status {
            status,
            body: body.to_owned(),
        })
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Scripts not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn to_owned<S: AsRef<str>>(fragments: &[S]) -> Vec<String> {
    fragments.iter().map(|s| s.as_ref().to_owned()).collect()
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<Generation, EngineError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                prompt: prompt.to_owned(),
                params: params.clone(),
            });

        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or(EngineError::Exhausted)?;

        let (fragments, tokens, hang, fail_with) = match script {
            Script::Status { status, body } => return Err(EngineError::Status { status, body }),
            Script::Fragments {
                fragments,
                prompt_tokens,
                hang,
                fail_with,
            } => (fragments, prompt_tokens, hang, fail_with),
        };

        let prompt_tokens = PromptTokens::default();
        let reporter = prompt_tokens.clone();
        let head = futures::stream::iter(fragments.into_iter().map(Ok));
        let tail = futures::stream::once(async move {
            reporter.set(tokens);
            fail_with.map(|message| Err(EngineError::Decode(message)))
        })
        .filter_map(futures::future::ready);
        let rest = if hang {
            tail.chain(futures::stream::pending()).boxed()
        } else {
            tail.boxed()
        };
        let fragments = head
            .chain(rest)
            .take_until(cancel.cancelled_owned())
            .boxed();

        Ok(Generation {
            fragments,
            prompt_tokens,
        })
    }
}
