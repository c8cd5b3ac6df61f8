//! Chat service: one per configured model.
//!
//! Drives a request through compilation, generation, interception and, when
//! the model calls registered tools, one orchestrated tool round followed by
//! a second generation.


use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::ConversationCompiler;
use crate::config::ModelProfile;
use crate::decoder::{InterceptDecoder, Increment, decode};
use crate::engine::{FragmentStream, GenerationEngine, GenerationParams};
use crate::error::{ChatError, ConfigError};
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkBuilder,
    CompletionChoice, CompletionRequest, CompletionResponse, Usage, new_completion_id, unix_now,
};
use crate::template::{TemplateRegistry, TemplateSet};
use crate::tool_prompt::{ToolPromptGenerator, ToolProtocol};
use crate::tools::ToolOrchestrator;
use crate::types::{ChoiceMode, CompiledPrompt, FinishReason, Message, ToolInvocation, ToolResult};

/// Sent back with detected tool calls when some of them are not registered
/// here, so the caller can run them and resubmit.
pub const REDIRECT_INSTRUCTIONS: &str = "One or more tools required to complete this request are not registered. \
Please execute the tool calls listed below and append the results to the original request in the following format:

1. Process each `tool_call` and execute the corresponding tool.
2. For each tool result, append a message to the `messages` array in the format:

   {
       \"role\": \"assistant\",
       \"content\": \"Tool Result for <tool_id>: <tool_result>\"
   }

3. Resubmit the updated request with the `messages` array containing the tool results for final processing.";

pub type ChatStream = BoxStream<'static, Result<ChatCompletionChunk, ChatError>>;
pub type CompletionStream = BoxStream<'static, Result<CompletionResponse, ChatError>>;

/// Everything bound to one model: its profile, resolved template set and
/// engine handle.
pub struct ModelContext {
    pub profile: ModelProfile,
    pub templates: TemplateSet,
    pub engine: Arc<dyn GenerationEngine>,
}

impl std::fmt::Debug for ModelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelContext")
            .field("profile", &self.profile.name)
            .field("templates", &self.templates)
            .finish_non_exhaustive()
    }
}

impl ModelContext {
    /// Resolve the profile's template family.
    pub fn from_profile(
        profile: ModelProfile,
        templates: &TemplateRegistry,
        engine: Arc<dyn GenerationEngine>,
    ) -> Result<Self, ConfigError> {
        let templates = templates.resolve(&profile.template)?;
        Ok(Self {
            profile,
            templates,
            engine,
        })
    }
}

/// A compiled conversation ready for generation.
struct Prepared {
    messages: Vec<Message>,
    tool_prompt: String,
    prompt: CompiledPrompt,
    params: GenerationParams,
}

#[derive(Debug, Clone)]
pub struct ChatService {
    context: Arc<ModelContext>,
    generator: Arc<ToolPromptGenerator>,
    orchestrator: ToolOrchestrator,
}

impl ChatService {
    /// Fails when the profile's tool protocol is missing or lacks its
    /// language.
    pub fn new(
        context: ModelContext,
        generator: Arc<ToolPromptGenerator>,
        orchestrator: ToolOrchestrator,
    ) -> Result<Self, ConfigError> {
        let settings = &context.profile.tool_prompt;
        generator
            .protocol(settings.index)?
            .check_language(&settings.lang)?;
        Ok(Self {
            context: Arc::new(context),
            generator,
            orchestrator,
        })
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.context.profile
    }

    pub fn orchestrator(&self) -> &ToolOrchestrator {
        &self.orchestrator
    }

    fn protocol(&self) -> Result<&ToolProtocol, ConfigError> {
        self.generator.protocol(self.context.profile.tool_prompt.index)
    }

    fn compile(&self, messages: &[Message], tool_prompt: &str) -> Result<CompiledPrompt, ConfigError> {
        let compiler = ConversationCompiler::new(&self.context.templates, self.protocol()?);
        let prompt = compiler.compile(
            messages,
            tool_prompt,
            self.context.profile.system_prompt.as_deref(),
        );
        debug!(
            model = %self.context.profile.name,
            tools = prompt.tool_protocol_enabled,
            prompt = %prompt.text,
            "compiled prompt"
        );
        Ok(prompt)
    }

    fn prepare(&self, request: &ChatCompletionRequest) -> Result<Prepared, ChatError> {
        if request.messages.is_empty() {
            warn!("no message in chat history");
            return Err(ChatError::EmptyConversation);
        }
        let settings = &self.context.profile.tool_prompt;
        let tool_prompt = self.generator.build_tool_prompt(
            &request.tool_declarations(),
            settings.index,
            &settings.lang,
            ChoiceMode::from_value(request.tool_choice.as_ref()),
        )?;
        let prompt = self.compile(&request.messages, &tool_prompt)?;
        let stop = GenerationParams::assemble_stop_sequences(
            &request.sampling.request_stops(),
            &self.context.profile.anti_prompts,
            prompt.tool_stop_words.as_deref(),
        );
        Ok(Prepared {
            messages: request.messages.clone(),
            tool_prompt,
            params: request.sampling.to_params(stop),
            prompt,
        })
    }

    /// Run one generation to completion.  Returns the text, the number of
    /// fragments and the engine's prompt-token count.
    async fn generate_text(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<(String, u32, u32), ChatError> {
        let generation = self
            .context
            .engine
            .generate(prompt, params, cancel.clone())
            .await?;
        let (text, fragments) = collect(generation.fragments, cancel).await?;
        Ok((text, fragments, generation.prompt_tokens.get()))
    }

    /// Non-streaming chat completion.
    pub async fn chat(
        &self,
        request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChatCompletionResponse, ChatError> {
        let Prepared {
            mut messages,
            tool_prompt,
            prompt,
            params,
        } = self.prepare(&request)?;

        let (mut text, mut completion_tokens, mut prompt_tokens) =
            self.generate_text(&prompt.text, &params, &cancel).await?;
        debug!(prompt_tokens, completion_tokens, "first round complete");

        if prompt.tool_protocol_enabled {
            let invocations = self.protocol()?.extract_invocations(&text);
            if !invocations.is_empty() {
                if !self.orchestrator.all_registered(&invocations) {
                    warn!(
                        tools = ?invocations.iter().map(ToolInvocation::name).collect::<Vec<_>>(),
                        "tools not registered; returning calls to the caller"
                    );
                    let message = Message {
                        content: Some(REDIRECT_INSTRUCTIONS.to_owned()),
                        ..Message::assistant_tool_calls(invocations)
                    };
                    return Ok(ChatCompletionResponse::new(
                        request.model,
                        message,
                        FinishReason::ToolCalls,
                        Usage::new(prompt_tokens, completion_tokens),
                    ));
                }

                let results = self.orchestrator.run_round(&invocations, &cancel).await;
                if cancel.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                messages.extend(results.iter().map(ToolResult::to_message));
                let second = self.compile(&messages, &tool_prompt)?;
                let (second_text, second_tokens, second_prompt_tokens) =
                    self.generate_text(&second.text, &params, &cancel).await?;
                text = second_text;
                completion_tokens += second_tokens;
                prompt_tokens = second_prompt_tokens;
            }
        }

        let finish_reason = FinishReason::for_budget(completion_tokens as usize, params.max_tokens);
        info!(
            model = %self.context.profile.name,
            prompt_tokens,
            completion_tokens,
            finish_reason = %finish_reason,
            "chat completion finished"
        );
        Ok(ChatCompletionResponse::new(
            request.model,
            Message::assistant(text),
            finish_reason,
            Usage::new(prompt_tokens, completion_tokens),
        ))
    }

    /// Streaming chat completion.  Configuration errors and an empty
    /// conversation are reported before the stream starts.
    pub fn chat_stream(
        &self,
        request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ChatError> {
        let prepared = self.prepare(&request)?;
        let protocol = self.protocol()?.clone();
        Ok(self
            .clone()
            .stream_chat(prepared, protocol, request.model, cancel)
            .boxed())
    }

    fn stream_chat(
        self,
        prepared: Prepared,
        protocol: ToolProtocol,
        model: String,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<ChatCompletionChunk, ChatError>> + Send + 'static {
        try_stream! {
            let Prepared { mut messages, tool_prompt, prompt, params } = prepared;
            let mut chunks = ChunkBuilder::new(model);
            yield chunks.role();

            let generation = self
                .context
                .engine
                .generate(&prompt.text, &params, cancel.clone())
                .await
                .map_err(ChatError::from)?;
            let decoder = InterceptDecoder::new(
                prompt.tool_protocol_enabled.then_some(protocol),
                params.max_tokens,
            );
            let mut increments = Box::pin(decode(generation.fragments, decoder, cancel.clone()));
            let mut detected: Option<Vec<ToolInvocation>> = None;
            let mut emitted = 0usize;
            while let Some(increment) = increments.next().await {
                match increment? {
                    Increment::Content(text) => {
                        emitted += 1;
                        yield chunks.content(text);
                    }
                    Increment::Finish(reason) => yield chunks.finish(reason),
                    Increment::ToolCalls(calls) => detected = Some(calls),
                }
            }

            if let Some(calls) = detected {
                if self.orchestrator.all_registered(&calls) {
                    let results = self.orchestrator.run_round(&calls, &cancel).await;
                    if cancel.is_cancelled() {
                        Err::<(), _>(ChatError::Cancelled)?;
                    }
                    messages.extend(results.iter().map(ToolResult::to_message));
                    let second = self.compile(&messages, &tool_prompt).map_err(ChatError::from)?;
                    let generation = self
                        .context
                        .engine
                        .generate(&second.text, &params, cancel.clone())
                        .await
                        .map_err(ChatError::from)?;
                    // Round two is plain content; tools are not detected again.
                    let decoder = InterceptDecoder::new(None, params.max_tokens);
                    let mut increments = Box::pin(decode(generation.fragments, decoder, cancel.clone()));
                    while let Some(increment) = increments.next().await {
                        match increment? {
                            Increment::Content(text) => {
                                emitted += 1;
                                yield chunks.content(text);
                            }
                            Increment::Finish(reason) => yield chunks.finish(reason),
                            Increment::ToolCalls(_) => {}
                        }
                    }
                } else {
                    warn!(
                        tools = ?calls.iter().map(ToolInvocation::name).collect::<Vec<_>>(),
                        "tools not registered; returning calls to the caller"
                    );
                    yield chunks.tool_calls(&calls, Some(REDIRECT_INSTRUCTIONS.to_owned()));
                }
            }
            info!(
                model = %self.context.profile.name,
                content_chunks = emitted,
                "chat stream finished"
            );
        }
    }

    fn completion_params(&self, request: &CompletionRequest) -> Result<GenerationParams, ChatError> {
        if request.prompt.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        let stop = GenerationParams::assemble_stop_sequences(
            &request.sampling.request_stops(),
            &self.context.profile.anti_prompts,
            None,
        );
        Ok(request.sampling.to_params(stop))
    }

    /// Raw prompt completion: no conversation compilation, no tools.
    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, ChatError> {
        let params = self.completion_params(&request)?;
        let (text, completion_tokens, prompt_tokens) =
            self.generate_text(&request.prompt, &params, &cancel).await?;
        let finish_reason = FinishReason::for_budget(completion_tokens as usize, params.max_tokens);
        let mut response = CompletionResponse::new(
            &new_completion_id(),
            unix_now(),
            &request.model,
            CompletionChoice {
                index: 0,
                text: Some(text),
                finish_reason: Some(finish_reason),
            },
        );
        response.usage = Some(Usage::new(prompt_tokens, completion_tokens));
        info!(model = %self.context.profile.name, prompt_tokens, completion_tokens, "completion finished");
        Ok(response)
    }

    pub fn complete_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ChatError> {
        let params = self.completion_params(&request)?;
        Ok(self
            .clone()
            .stream_completion(request, params, cancel)
            .boxed())
    }

    fn stream_completion(
        self,
        request: CompletionRequest,
        params: GenerationParams,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<CompletionResponse, ChatError>> + Send + 'static {
        try_stream! {
            let id = new_completion_id();
            let created = unix_now();
            let generation = self
                .context
                .engine
                .generate(&request.prompt, &params, cancel.clone())
                .await
                .map_err(ChatError::from)?;
            let decoder = InterceptDecoder::new(None, params.max_tokens);
            let mut increments = Box::pin(decode(generation.fragments, decoder, cancel.clone()));
            let mut index = 0u32;
            while let Some(increment) = increments.next().await {
                let (text, finish_reason) = match increment? {
                    Increment::Content(text) => (Some(text), None),
                    Increment::Finish(reason) => (None, Some(reason)),
                    Increment::ToolCalls(_) => continue,
                };
                yield CompletionResponse::new(
                    &id,
                    created,
                    &request.model,
                    CompletionChoice { index, text, finish_reason },
                );
                index += 1;
            }
        }
    }
}

/// Drain a fragment stream into one string, honouring cancellation.
async fn collect(
    mut fragments: FragmentStream,
    cancel: &CancellationToken,
) -> Result<(String, u32), ChatError> {
    let mut text = String::new();
    let mut count = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            next = fragments.next() => match next {
                Some(fragment) => {
                    text.push_str(&fragment?);
                    count += 1;
                }
                None => break,
            },
        }
    }
    Ok((text, count))
}
