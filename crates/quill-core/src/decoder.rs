//! Streaming interception decoder.
//!
//! Classifies an in-progress generation as either a tool invocation or plain
//! content from its first [`LOOKAHEAD`] fragments.  Content is forwarded
//! fragment by fragment; a tool invocation is held back until the engine is
//! done and then surfaced as a single [`Increment::ToolCalls`].

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::engine::FragmentStream;
use crate::error::ChatError;
use crate::tool_prompt::ToolProtocol;
use crate::types::{FinishReason, ToolInvocation};

/// Fragments inspected before deciding between tool call and content.
pub const LOOKAHEAD: usize = 3;

/// One client-visible step of a decoded generation.
#[derive(Debug, Clone, PartialEq)]
pub enum Increment {
    Content(String),
    /// Terminal: the generation was a tool invocation.
    ToolCalls(Vec<ToolInvocation>),
    /// Terminal: the generation ended as content.
    Finish(FinishReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Buffering,
    ToolActive,
    Passthrough,
    Done,
}

/// Synchronous core of the decoder: feed fragments with [`push`], then call
/// [`finish`] once the source is exhausted.
///
/// [`push`]: InterceptDecoder::push
/// [`finish`]: InterceptDecoder::finish
#[derive(Debug)]
pub struct InterceptDecoder {
    protocol: Option<ToolProtocol>,
    max_tokens: Option<u32>,
    state: State,
    buffer: Vec<String>,
    received: usize,
}

impl InterceptDecoder {
    /// `protocol` is `Some` only when the tool protocol is enabled for this
    /// generation; without it every fragment passes straight through.
    pub fn new(protocol: Option<ToolProtocol>, max_tokens: Option<u32>) -> Self {
        let state = if protocol.is_some() {
            State::Buffering
        } else {
            State::Passthrough
        };
        Self {
            protocol,
            max_tokens,
            state,
            buffer: Vec::with_capacity(LOOKAHEAD),
            received: 0,
        }
    }

    /// Fragments received so far.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_tool_active(&self) -> bool {
        self.state == State::ToolActive
    }

    pub fn push(&mut self, fragment: String) -> Vec<Increment> {
        self.received += 1;
        trace!(fragment = %fragment, state = ?self.state, "decoder fragment");
        match self.state {
            State::Passthrough => vec![Increment::Content(fragment)],
            State::ToolActive => {
                self.buffer.push(fragment);
                Vec::new()
            }
            State::Buffering => {
                self.buffer.push(fragment);
                if self.buffer.len() < LOOKAHEAD {
                    return Vec::new();
                }
                let is_tool = self
                    .protocol
                    .as_ref()
                    .is_some_and(|protocol| protocol.classify_prefix(&self.buffer));
                if is_tool {
                    debug!("tool invocation detected in generation prefix");
                    self.state = State::ToolActive;
                    Vec::new()
                } else {
                    self.state = State::Passthrough;
                    self.replay()
                }
            }
            State::Done => Vec::new(),
        }
    }

    /// Terminal increments once the source is exhausted.
    pub fn finish(&mut self) -> Vec<Increment> {
        let state = std::mem::replace(&mut self.state, State::Done);
        match state {
            State::ToolActive => {
                let text = self.buffer.concat();
                let invocations = self
                    .protocol
                    .as_ref()
                    .map(|protocol| protocol.extract_invocations(text.trim()))
                    .unwrap_or_default();
                if invocations.is_empty() {
                    debug!("tool prefix matched but no invocation extracted; replaying");
                    let mut out = self.replay();
                    out.push(Increment::Finish(FinishReason::Stop));
                    out
                } else {
                    self.buffer.clear();
                    vec![Increment::ToolCalls(invocations)]
                }
            }
            // Fewer than LOOKAHEAD fragments: not enough to be a tool call.
            State::Buffering | State::Passthrough => {
                let mut out = self.replay();
                out.push(Increment::Finish(FinishReason::for_budget(
                    self.received,
                    self.max_tokens,
                )));
                out
            }
            State::Done => Vec::new(),
        }
    }

    fn replay(&mut self) -> Vec<Increment> {
        self.buffer.drain(..).map(Increment::Content).collect()
    }
}

/// Drive `decoder` over `fragments` until exhaustion or cancellation.
///
/// Cancellation ends the stream with [`ChatError::Cancelled`] and no
/// terminal increment.
pub fn decode(
    mut fragments: FragmentStream,
    mut decoder: InterceptDecoder,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Increment, ChatError>> + Send + 'static {
    try_stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = fragments.next() => Some(next),
            };
            let Some(next) = next else {
                debug!(received = decoder.received(), "generation cancelled");
                Err::<(), _>(ChatError::Cancelled)?;
                break;
            };
            let Some(fragment) = next else { break };
            let fragment = fragment.map_err(ChatError::from)?;
            for increment in decoder.push(fragment) {
                yield increment;
            }
        }
        for increment in decoder.finish() {
            yield increment;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures::TryStreamExt;

    use super::*;
    use crate::engine::{GenerationEngine, GenerationParams, ScriptedEngine};
    use crate::template::{ToolProtocolConfig, default_protocols};
    use crate::tool_prompt::ToolPromptGenerator;

    /// A protocol whose name marker is the single letter "A", so that the
    /// fragments A, B, C, D read as a tool call.
    fn letter_protocol() -> ToolProtocol {
        let en = |s: &str| HashMap::from([("en".to_owned(), s.to_owned())]);
        let cfg = ToolProtocolConfig {
            description: String::new(),
            name_placeholder: "A".into(),
            args_placeholder: "C".into(),
            result_placeholder: "R".into(),
            exit_marker: "X".into(),
            call_template: "A{0}C{1}".into(),
            result_template: "R{0}".into(),
            result_split_marker: String::new(),
            extraction_pattern: "A(B)C(D)".into(),
            args_group: 2,
            stop_words: Vec::new(),
            call_template_info: en("{tool_descs}"),
            call_template_fmt: en("{0}"),
            call_template_fmt_para: en("{0}"),
            tool_desc_template: HashMap::new(),
        };
        ToolPromptGenerator::new(vec![cfg])
            .unwrap()
            .protocol(0)
            .unwrap()
            .clone()
    }

    fn builtin_protocol() -> ToolProtocol {
        ToolPromptGenerator::new(default_protocols())
            .unwrap()
            .protocol(0)
            .unwrap()
            .clone()
    }

    fn content(s: &str) -> Increment {
        Increment::Content(s.to_owned())
    }

    #[test]
    fn nothing_is_emitted_before_lookahead_then_prefix_is_replayed() {
        let mut decoder = InterceptDecoder::new(Some(builtin_protocol()), None);
        assert!(decoder.push("A".into()).is_empty());
        assert!(decoder.push("B".into()).is_empty());
        assert_eq!(
            decoder.push("C".into()),
            vec![content("A"), content("B"), content("C")]
        );
        assert_eq!(decoder.push("D".into()), vec![content("D")]);
        assert_eq!(decoder.finish(), vec![Increment::Finish(FinishReason::Stop)]);
    }

    #[test]
    fn detected_tool_call_emits_single_terminal_increment() {
        let mut decoder = InterceptDecoder::new(Some(letter_protocol()), None);
        for fragment in ["A", "B", "C", "D"] {
            assert!(decoder.push(fragment.into()).is_empty());
        }
        assert!(decoder.is_tool_active());
        let out = decoder.finish();
        assert_eq!(out.len(), 1);
        let Increment::ToolCalls(calls) = &out[0] else {
            panic!("expected tool calls, got {out:?}");
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "B");
        assert_eq!(calls[0].arguments(), Some("D"));
    }

    #[test]
    fn tool_prefix_without_match_replays_and_stops() {
        let mut decoder = InterceptDecoder::new(Some(letter_protocol()), Some(4));
        for fragment in ["A", "x", "y", "z"] {
            assert!(decoder.push(fragment.into()).is_empty());
        }
        assert_eq!(
            decoder.finish(),
            vec![
                content("A"),
                content("x"),
                content("y"),
                content("z"),
                Increment::Finish(FinishReason::Stop),
            ]
        );
    }

    #[test]
    fn short_generation_is_replayed_on_exhaustion() {
        let mut decoder = InterceptDecoder::new(Some(builtin_protocol()), Some(2));
        assert!(decoder.push("Hi".into()).is_empty());
        assert!(decoder.push("!".into()).is_empty());
        assert_eq!(
            decoder.finish(),
            vec![content("Hi"), content("!"), Increment::Finish(FinishReason::Length)]
        );
    }

    #[test]
    fn disabled_protocol_passes_through() {
        let mut decoder = InterceptDecoder::new(None, Some(2));
        assert_eq!(decoder.push("✿FUNCTION✿".into()), vec![content("✿FUNCTION✿")]);
        assert_eq!(decoder.push(": x".into()), vec![content(": x")]);
        assert_eq!(decoder.finish(), vec![Increment::Finish(FinishReason::Length)]);
        assert!(decoder.finish().is_empty());
    }

    #[tokio::test]
    async fn decode_runs_over_engine_fragments() {
        let engine = ScriptedEngine::new();
        engine.queue(&["✿FUNC", "TION✿", ": lookup\n", "✿ARGS✿: ", "{\"q\":1}"]);
        let generation = engine
            .generate("p", &GenerationParams::default(), CancellationToken::new())
            .await
            .unwrap();
        let decoder = InterceptDecoder::new(Some(builtin_protocol()), None);
        let out: Vec<Increment> = decode(generation.fragments, decoder, CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        let Increment::ToolCalls(calls) = &out[0] else {
            panic!("expected tool calls, got {out:?}");
        };
        assert_eq!(calls[0].name(), "lookup");
        assert_eq!(calls[0].arguments(), Some("{\"q\":1}"));
    }

    #[tokio::test]
    async fn cancellation_ends_without_terminal_increment() {
        let engine = ScriptedEngine::new();
        engine.queue_hanging(&["a", "b", "c", "d"]);
        let cancel = CancellationToken::new();
        let generation = engine
            .generate("p", &GenerationParams::default(), cancel.clone())
            .await
            .unwrap();
        let decoder = InterceptDecoder::new(None, None);
        let mut stream = Box::pin(decode(generation.fragments, decoder, cancel.clone()));

        for expected in ["a", "b", "c", "d"] {
            assert_eq!(stream.next().await.unwrap().unwrap(), content(expected));
        }
        cancel.cancel();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(stream.next().await.is_none());
    }
}
