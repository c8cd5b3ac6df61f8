//! Conversation compiler.
//!
//! Walks a message list once and flattens it into a single prompt string for
//! a text-generation engine, pairing assistant tool calls with the tool
//! results that answer them.

use tracing::{debug, warn};

use crate::template::TemplateSet;
use crate::tool_prompt::ToolProtocol;
use crate::types::{CompiledPrompt, Message, Role};

/// Compiles conversations for one model family and tool protocol.
#[derive(Debug, Clone, Copy)]
pub struct ConversationCompiler<'a> {
    templates: &'a TemplateSet,
    protocol: &'a ToolProtocol,
}

/// Single-pass state.
#[derive(Default)]
struct CompileState {
    out: String,
    /// Open tool calls, in call order, with their rendered results once known.
    pending: Vec<(String, String)>,
    tool_wait: bool,
    system_added: bool,
    carried_system: String,
}

impl CompileState {
    fn line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn flush_pending(&mut self) {
        for (_, rendered) in std::mem::take(&mut self.pending) {
            self.out.push_str(&rendered);
            self.out.push('\n');
        }
    }
}

impl<'a> ConversationCompiler<'a> {
    pub fn new(templates: &'a TemplateSet, protocol: &'a ToolProtocol) -> Self {
        Self {
            templates,
            protocol,
        }
    }

    /// Compile `messages` into a prompt.
    ///
    /// A system section is synthesised from `default_system` only when the
    /// conversation has none and either `tool_prompt` or `default_system` is
    /// non-blank.
    pub fn compile(
        &self,
        messages: &[Message],
        tool_prompt: &str,
        default_system: Option<&str>,
    ) -> CompiledPrompt {
        let tool_protocol_enabled = !tool_prompt.trim().is_empty();
        let default_system = default_system.unwrap_or("");
        let has_system = messages.iter().any(|m| m.role == Role::System);

        let synthetic = (!has_system
            && (tool_protocol_enabled || !default_system.trim().is_empty()))
        .then(|| Message::system(default_system));
        if synthetic.is_some() {
            debug!("adding default system prompt");
        }

        let mut state = CompileState::default();
        for message in synthetic.iter().chain(messages) {
            self.step(&mut state, message, tool_prompt);
        }
        self.finish(&mut state, messages.last());

        CompiledPrompt {
            text: state.out,
            tool_protocol_enabled,
            tool_stop_words: tool_protocol_enabled.then(|| self.protocol.stop_words().to_vec()),
        }
    }

    fn step(&self, state: &mut CompileState, message: &Message, tool_prompt: &str) {
        let t = self.templates;
        match message.role {
            Role::User => {
                if state.tool_wait {
                    // Results not yet supplied are dropped with the window.
                    if state.pending.iter().any(|(_, rendered)| !rendered.is_empty()) {
                        warn!(
                            pending = state.pending.len(),
                            "user turn closed an open tool window; discarding tool results"
                        );
                    }
                    state.pending.clear();
                    state.tool_wait = false;
                    state.line(&t.end);
                }
                let carried = std::mem::take(&mut state.carried_system);
                state.line(&format!("{}\n{}{}{}", t.user, carried, message.text(), t.end));
            }
            Role::System => {
                if state.system_added || state.tool_wait {
                    return;
                }
                state.system_added = true;
                if t.has_system_turn() {
                    state.line(&format!(
                        "{}\n{}{}{}",
                        t.system,
                        message.text(),
                        tool_prompt,
                        t.end
                    ));
                } else {
                    state.carried_system = format!("{} {}", message.text(), tool_prompt);
                }
            }
            Role::Assistant if state.tool_wait => {
                state.flush_pending();
                let reply = self.protocol.render_call_return(message.text());
                state.line(&format!("{reply}{}", t.end));
                state.tool_wait = false;
            }
            Role::Assistant if message.has_tool_calls() => {
                state.line(&t.assistant);
                for call in message.tool_calls.iter().flatten() {
                    state.line(&self.protocol.render_call(call));
                    state.pending.push((call.id.clone(), String::new()));
                }
                state.out.push_str(self.protocol.result_split_marker());
                state.tool_wait = true;
            }
            Role::Assistant => {
                state.line(&format!("{}\n{}{}", t.assistant, message.text(), t.end));
            }
            Role::Tool => {
                let slot = match message.tool_call_id.as_deref() {
                    Some(id) if state.tool_wait => {
                        state.pending.iter_mut().find(|(pending_id, _)| pending_id == id)
                    }
                    _ => None,
                };
                match slot {
                    Some((_, rendered)) => *rendered = self.protocol.render_result(message.text()),
                    None => warn!(
                        tool_call_id = message.tool_call_id.as_deref().unwrap_or(""),
                        "ignoring tool result with no matching open call"
                    ),
                }
            }
        }
    }

    fn finish(&self, state: &mut CompileState, last: Option<&Message>) {
        let t = self.templates;
        let last_is_tool = last.is_some_and(|m| m.role == Role::Tool);
        if last_is_tool && !state.pending.is_empty() {
            state.flush_pending();
            state.line(&self.protocol.config().exit_marker);
        } else if state.tool_wait {
            state.line(&format!("{}{}", t.end, t.assistant));
        } else {
            state.line(&t.assistant);
        }
    }
}
