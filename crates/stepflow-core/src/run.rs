//! Step event transformation and continuation for one `stream_text` run.
//!
//! Every step is a generator over its tool-handled model stream. It forwards events to the
//! shared multiplexer and, once the model stream is drained, either launches the next step by
//! appending that step's generator to the multiplexer or finishes the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_stream::stream;
use futures_util::stream::StreamExt;
use stepflow_ai::{
    retry_with_exponential_backoff, AbortSignal, CallOptions, CallSettings, CallWarning,
    FinishReason, LanguageModelRef, LogProbs, Message, ModelStreamResponse, PromptFormat,
    ProviderMetadata, RawResponse, RequestMetadata, ResponseMetadata, RetryPolicy, StepflowError,
    StitchHandle, StitchSource, TextStreamPart, ToolCall, ToolChoice, ToolResult, ToolSpec, Usage,
};
use tracing::{debug, warn};

use crate::continuation::{decide_next_step, ContinuationInput, NextStep};
use crate::messages::{append_continuation, to_response_messages};
use crate::options::RunEnvironment;
use crate::result::AggregateResolvers;
use crate::tools::{run_tools, StepStreamPart, ToolSet};
use crate::types::{
    FinishEvent, OnChunkFn, OnFinishFn, OnStepFinishFn, StepKind, StepResponse, StepResult,
};
use crate::whitespace::{TextSegmenter, WhitespaceCarry};

pub(crate) struct RunConfig {
    pub max_steps: usize,
    pub continue_steps: bool,
    pub tool_call_streaming: bool,
    pub tool_specs: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    pub settings: CallSettings,
    pub headers: HashMap<String, String>,
    pub provider_metadata: Option<ProviderMetadata>,
    pub abort_signal: Option<AbortSignal>,
    pub retry: RetryPolicy,
}

#[derive(Default)]
pub(crate) struct RunCallbacks {
    pub on_chunk: Option<OnChunkFn>,
    pub on_step_finish: Option<OnStepFinishFn>,
    pub on_finish: Option<OnFinishFn>,
}

#[derive(Default)]
struct RunState {
    steps: Vec<StepResult>,
    response_messages: Vec<Message>,
}

/// State shared by every step generator of a run.
pub(crate) struct RunShared {
    model: LanguageModelRef,
    tools: Arc<ToolSet>,
    config: RunConfig,
    callbacks: RunCallbacks,
    environment: RunEnvironment,
    output: StitchHandle<TextStreamPart>,
    state: Mutex<RunState>,
    resolvers: Mutex<Option<AggregateResolvers>>,
}

impl RunShared {
    pub(crate) fn new(
        model: LanguageModelRef,
        tools: ToolSet,
        config: RunConfig,
        callbacks: RunCallbacks,
        environment: RunEnvironment,
        output: StitchHandle<TextStreamPart>,
        resolvers: AggregateResolvers,
    ) -> Self {
        Self {
            model,
            tools: Arc::new(tools),
            config,
            callbacks,
            environment,
            output,
            state: Mutex::new(RunState::default()),
            resolvers: Mutex::new(Some(resolvers)),
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now(&self) -> u64 {
        (self.environment.now)()
    }

    /// Calls the model for one step, retrying transient failures.
    pub(crate) async fn call_model(
        &self,
        step: usize,
        kind: StepKind,
        input_format: PromptFormat,
        prompt: Vec<Message>,
    ) -> Result<ModelStreamResponse, StepflowError> {
        debug!(
            provider = self.model.provider(),
            model = self.model.model_id(),
            step,
            step_type = kind.as_str(),
            messages = prompt.len(),
            "starting model call"
        );
        let options = CallOptions {
            input_format,
            prompt,
            tools: self.config.tool_specs.clone(),
            tool_choice: self.config.tool_choice.clone(),
            settings: self.config.settings.clone(),
            headers: self.config.headers.clone(),
            provider_metadata: self.config.provider_metadata.clone(),
            abort_signal: self.config.abort_signal.clone(),
        };
        retry_with_exponential_backoff(
            &self.config.retry,
            self.config.abort_signal.as_ref(),
            || self.model.do_stream(options.clone()),
        )
        .await
    }

    /// Ends the run with `error`: aggregates are rejected and no further steps are accepted.
    fn fail(&self, error: &StepflowError) {
        let resolvers = self
            .resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(resolvers) = resolvers {
            warn!(
                provider = self.model.provider(),
                model = self.model.model_id(),
                error_code = ?error.code,
                error = error.message.as_str(),
                "stream text run failed"
            );
            resolvers.reject(error);
        }
        self.output.close();
    }

    fn complete(&self, event: &FinishEvent) {
        self.output.close();
        let resolvers = self
            .resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(resolvers) = resolvers {
            debug!(
                provider = self.model.provider(),
                model = self.model.model_id(),
                steps = event.steps.len(),
                finish_reason = ?event.finish_reason,
                total_tokens = event.usage.total_tokens,
                "stream text run finished"
            );
            resolvers.resolve(event);
        }
    }

    async fn emit_chunk(&self, chunk: &TextStreamPart) -> Result<(), StepflowError> {
        match &self.callbacks.on_chunk {
            Some(callback) if chunk.is_chunk() => callback.on_chunk(chunk.clone()).await,
            _ => Ok(()),
        }
    }
}

/// Work item describing a step whose model call has already been made.
pub(crate) struct StepLaunch {
    pub index: usize,
    pub kind: StepKind,
    pub transcript: Vec<Message>,
    pub usage_so_far: Usage,
    /// Text of the preceding `continue` chain, extended by this step when it continues it.
    pub previous_text: String,
    pub carry: WhitespaceCarry,
    pub response: ModelStreamResponse,
    pub started_at: u64,
}

/// Per-step accumulation of the transformed events.
struct StepState {
    kind: StepKind,
    segmenter: TextSegmenter,
    text: String,
    full_text: String,
    tool_calls: Vec<ToolCall>,
    tool_results: Vec<ToolResult>,
    finish_reason: FinishReason,
    usage: Usage,
    provider_metadata: Option<ProviderMetadata>,
    logprobs: Option<LogProbs>,
    response: ResponseMetadata,
}

impl StepState {
    fn new(
        kind: StepKind,
        continue_steps: bool,
        previous_text: String,
        carry: WhitespaceCarry,
        response: ResponseMetadata,
    ) -> Self {
        let full_text = if kind == StepKind::Continue {
            previous_text
        } else {
            String::new()
        };
        Self {
            kind,
            segmenter: TextSegmenter::new(continue_steps, carry),
            text: String::new(),
            full_text,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            finish_reason: FinishReason::Unknown,
            usage: Usage::default(),
            provider_metadata: None,
            logprobs: None,
            response,
        }
    }

    fn publish_text(&mut self, text: String) -> TextStreamPart {
        self.text.push_str(&text);
        self.full_text.push_str(&text);
        TextStreamPart::TextDelta { text_delta: text }
    }

    /// Folds one event into the step and returns the outward event, if any.
    fn accept(&mut self, part: StepStreamPart) -> Option<TextStreamPart> {
        match part {
            StepStreamPart::TextDelta(delta) => {
                let text = self.segmenter.push(&delta)?;
                Some(self.publish_text(text))
            }
            StepStreamPart::ToolCall(call) => {
                self.tool_calls.push(call.clone());
                Some(TextStreamPart::ToolCall(call))
            }
            StepStreamPart::ToolResult(result) => {
                self.tool_results.push(result.clone());
                Some(TextStreamPart::ToolResult(result))
            }
            StepStreamPart::ToolCallStreamingStart {
                tool_call_id,
                tool_name,
            } => Some(TextStreamPart::ToolCallStreamingStart {
                tool_call_id,
                tool_name,
            }),
            StepStreamPart::ToolCallDelta {
                tool_call_id,
                tool_name,
                args_text_delta,
            } => Some(TextStreamPart::ToolCallDelta {
                tool_call_id,
                tool_name,
                args_text_delta,
            }),
            StepStreamPart::ResponseMetadata {
                id,
                timestamp,
                model_id,
            } => {
                if let Some(id) = id {
                    self.response.id = id;
                }
                if let Some(timestamp) = timestamp {
                    self.response.timestamp = timestamp;
                }
                if let Some(model_id) = model_id {
                    self.response.model_id = model_id;
                }
                None
            }
            StepStreamPart::Finish {
                finish_reason,
                usage,
                provider_metadata,
                logprobs,
            } => {
                self.finish_reason = finish_reason;
                self.usage = usage;
                self.provider_metadata = provider_metadata;
                self.logprobs = logprobs;
                None
            }
            StepStreamPart::Error(error) => {
                self.finish_reason = FinishReason::Error;
                Some(TextStreamPart::Error { error })
            }
        }
    }

    fn flush_text(&mut self, next: NextStep) -> Option<TextStreamPart> {
        let text = self.segmenter.flush(self.kind, next)?;
        Some(self.publish_text(text))
    }

    fn step_finish(&self, is_continued: bool) -> TextStreamPart {
        TextStreamPart::StepFinish {
            finish_reason: self.finish_reason,
            usage: self.usage,
            provider_metadata: self.provider_metadata.clone(),
            logprobs: self.logprobs.clone(),
            response: self.response.clone(),
            is_continued,
        }
    }
}

/// Metadata returned alongside a step's model stream.
struct StepCall {
    warnings: Vec<CallWarning>,
    request: RequestMetadata,
    raw_response: RawResponse,
}

pub(crate) fn step_stream(
    shared: Arc<RunShared>,
    launch: StepLaunch,
) -> StitchSource<TextStreamPart> {
    Box::pin(stream! {
        let StepLaunch {
            index,
            kind,
            mut transcript,
            usage_so_far,
            previous_text,
            carry,
            response,
            started_at,
        } = launch;
        let ModelStreamResponse {
            stream: raw,
            warnings,
            request,
            raw_response,
        } = response;
        let call = StepCall {
            warnings,
            request,
            raw_response,
        };
        let seed = ResponseMetadata {
            id: (shared.environment.generate_id)(),
            timestamp: (shared.environment.current_date)(),
            model_id: shared.model.model_id().to_string(),
        };
        let mut step = StepState::new(
            kind,
            shared.config.continue_steps,
            previous_text,
            carry,
            seed,
        );
        let mut parts = run_tools(
            raw,
            shared.tools.clone(),
            shared.config.tool_call_streaming,
            shared.config.abort_signal.clone(),
        );
        let mut first_chunk = true;

        loop {
            let item = match shared.config.abort_signal.as_ref() {
                Some(signal) => tokio::select! {
                    item = parts.next() => item,
                    _ = signal.cancelled() => Some(Err(StepflowError::aborted())),
                },
                None => parts.next().await,
            };
            let part = match item {
                None => break,
                Some(Ok(part)) => part,
                Some(Err(error)) => {
                    shared.fail(&error);
                    yield Err(error);
                    return;
                }
            };

            if first_chunk {
                first_chunk = false;
                debug!(
                    step = index,
                    ms_to_first_chunk = shared.now().saturating_sub(started_at),
                    "step received first chunk"
                );
            }
            if let StepStreamPart::Finish { usage, .. } = &part {
                debug!(
                    step = index,
                    ms_to_finish = shared.now().saturating_sub(started_at),
                    completion_tokens = usage.completion_tokens,
                    "step model stream finished"
                );
            }

            if let Some(event) = step.accept(part) {
                let callback = shared.emit_chunk(&event).await;
                yield Ok(event);
                if let Err(error) = callback {
                    shared.fail(&error);
                    yield Err(error);
                    return;
                }
            }
        }

        let next = decide_next_step(&ContinuationInput {
            step_index: index,
            max_steps: shared.config.max_steps,
            continue_steps: shared.config.continue_steps,
            finish_reason: step.finish_reason,
            tool_calls: &step.tool_calls,
            tool_results: &step.tool_results,
        });
        debug!(
            step = index,
            step_type = kind.as_str(),
            finish_reason = ?step.finish_reason,
            tool_calls = step.tool_calls.len(),
            tool_results = step.tool_results.len(),
            next_step = next.as_str(),
            "step finished"
        );

        if let Some(event) = step.flush_text(next) {
            let callback = shared.emit_chunk(&event).await;
            yield Ok(event);
            if let Err(error) = callback {
                shared.fail(&error);
                yield Err(error);
                return;
            }
        }

        let is_continued = next == NextStep::Continue;
        yield Ok(step.step_finish(is_continued));

        let step_result = {
            let mut state = shared.state();
            if kind == StepKind::Continue {
                append_continuation(&mut state.response_messages, &step.text);
            } else {
                let messages =
                    to_response_messages(&step.text, &step.tool_calls, &step.tool_results);
                state.response_messages.extend(messages);
            }
            let result = StepResult {
                step_type: kind,
                text: step.text.clone(),
                tool_calls: step.tool_calls.clone(),
                tool_results: step.tool_results.clone(),
                finish_reason: step.finish_reason,
                usage: step.usage,
                warnings: call.warnings.clone(),
                logprobs: step.logprobs.clone(),
                request: call.request.clone(),
                response: StepResponse {
                    id: step.response.id.clone(),
                    timestamp: step.response.timestamp,
                    model_id: step.response.model_id.clone(),
                    headers: call.raw_response.headers.clone(),
                    messages: state.response_messages.clone(),
                },
                provider_metadata: step.provider_metadata.clone(),
                is_continued,
            };
            state.steps.push(result.clone());
            result
        };

        if let Some(callback) = &shared.callbacks.on_step_finish {
            if let Err(error) = callback.on_step_finish(step_result.clone()).await {
                shared.fail(&error);
                yield Err(error);
                return;
            }
        }

        let usage = usage_so_far + step.usage;

        let next_kind = match next.step_kind() {
            Some(next_kind) => next_kind,
            None => {
                let steps = shared.state().steps.clone();
                let event = FinishEvent {
                    finish_reason: step.finish_reason,
                    usage,
                    text: step.full_text.clone(),
                    tool_calls: step.tool_calls.clone(),
                    tool_results: step.tool_results.clone(),
                    request: call.request.clone(),
                    response: step_result.response.clone(),
                    warnings: call.warnings.clone(),
                    provider_metadata: step.provider_metadata.clone(),
                    logprobs: step.logprobs.clone(),
                    steps,
                };
                let finish = TextStreamPart::Finish {
                    finish_reason: step.finish_reason,
                    usage,
                    provider_metadata: step.provider_metadata.clone(),
                    logprobs: step.logprobs.clone(),
                    response: step_result.response.metadata(),
                };
                shared.complete(&event);
                let callback = match &shared.callbacks.on_finish {
                    Some(callback) => callback.on_finish(event).await,
                    None => Ok(()),
                };
                yield Ok(finish);
                if let Err(error) = callback {
                    warn!(
                        error_code = ?error.code,
                        error = error.message.as_str(),
                        "finish callback failed"
                    );
                    yield Err(error);
                }
                return;
            }
        };

        if kind == StepKind::Continue {
            append_continuation(&mut transcript, step.segmenter.received());
        } else {
            transcript.extend(to_response_messages(
                step.segmenter.received(),
                &step.tool_calls,
                &step.tool_results,
            ));
        }

        if shared
            .config
            .abort_signal
            .as_ref()
            .is_some_and(AbortSignal::is_aborted)
        {
            let error = StepflowError::aborted();
            shared.fail(&error);
            yield Err(error);
            return;
        }

        let next_index = index + 1;
        let started_at = shared.now();
        let response = match shared
            .call_model(next_index, next_kind, PromptFormat::Messages, transcript.clone())
            .await
        {
            Ok(response) => response,
            Err(error) => {
                shared.fail(&error);
                yield Err(error);
                return;
            }
        };
        let launch = StepLaunch {
            index: next_index,
            kind: next_kind,
            transcript,
            usage_so_far: usage,
            previous_text: step.full_text,
            carry: step.segmenter.into_carry(),
            response,
            started_at,
        };
        if let Err(error) = shared.output.append(step_stream(shared.clone(), launch)) {
            shared.fail(&error);
            yield Err(error);
        }
    })
}
