use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{Stream, StreamExt};
use stepflow_ai::{
    resolvable, CallWarning, EventFork, EventHub, FinishReason, Message, ProviderMetadata,
    RequestMetadata, Resolvable, Resolver, StepflowError, TextStreamPart, ToolCall, ToolResult,
    Usage,
};

use crate::types::{FinishEvent, StepResponse, StepResult};

/// Producer halves of the run's aggregate results. Settled together, exactly once.
pub(crate) struct AggregateResolvers {
    usage: Resolver<Usage>,
    finish_reason: Resolver<FinishReason>,
    text: Resolver<String>,
    tool_calls: Resolver<Vec<ToolCall>>,
    tool_results: Resolver<Vec<ToolResult>>,
    steps: Resolver<Vec<StepResult>>,
    request: Resolver<RequestMetadata>,
    response: Resolver<StepResponse>,
    warnings: Resolver<Vec<CallWarning>>,
    provider_metadata: Resolver<Option<ProviderMetadata>>,
    response_messages: Resolver<Vec<Message>>,
}

impl AggregateResolvers {
    pub(crate) fn resolve(self, event: &FinishEvent) {
        self.usage.resolve(event.usage);
        self.finish_reason.resolve(event.finish_reason);
        self.text.resolve(event.text.clone());
        self.tool_calls.resolve(event.tool_calls.clone());
        self.tool_results.resolve(event.tool_results.clone());
        self.steps.resolve(event.steps.clone());
        self.request.resolve(event.request.clone());
        self.warnings.resolve(event.warnings.clone());
        self.provider_metadata.resolve(event.provider_metadata.clone());
        self.response_messages
            .resolve(event.response.messages.clone());
        self.response.resolve(event.response.clone());
    }

    pub(crate) fn reject(self, error: &StepflowError) {
        self.usage.reject(error.clone());
        self.finish_reason.reject(error.clone());
        self.text.reject(error.clone());
        self.tool_calls.reject(error.clone());
        self.tool_results.reject(error.clone());
        self.steps.reject(error.clone());
        self.request.reject(error.clone());
        self.response.reject(error.clone());
        self.warnings.reject(error.clone());
        self.provider_metadata.reject(error.clone());
        self.response_messages.reject(error.clone());
    }
}

#[derive(Clone)]
struct AggregateResolvables {
    usage: Resolvable<Usage>,
    finish_reason: Resolvable<FinishReason>,
    text: Resolvable<String>,
    tool_calls: Resolvable<Vec<ToolCall>>,
    tool_results: Resolvable<Vec<ToolResult>>,
    steps: Resolvable<Vec<StepResult>>,
    request: Resolvable<RequestMetadata>,
    response: Resolvable<StepResponse>,
    warnings: Resolvable<Vec<CallWarning>>,
    provider_metadata: Resolvable<Option<ProviderMetadata>>,
    response_messages: Resolvable<Vec<Message>>,
}

pub(crate) fn aggregate_channels() -> (AggregateResolvers, StreamTextAggregates) {
    let (usage, usage_rx) = resolvable();
    let (finish_reason, finish_reason_rx) = resolvable();
    let (text, text_rx) = resolvable();
    let (tool_calls, tool_calls_rx) = resolvable();
    let (tool_results, tool_results_rx) = resolvable();
    let (steps, steps_rx) = resolvable();
    let (request, request_rx) = resolvable();
    let (response, response_rx) = resolvable();
    let (warnings, warnings_rx) = resolvable();
    let (provider_metadata, provider_metadata_rx) = resolvable();
    let (response_messages, response_messages_rx) = resolvable();
    (
        AggregateResolvers {
            usage,
            finish_reason,
            text,
            tool_calls,
            tool_results,
            steps,
            request,
            response,
            warnings,
            provider_metadata,
            response_messages,
        },
        StreamTextAggregates {
            inner: AggregateResolvables {
                usage: usage_rx,
                finish_reason: finish_reason_rx,
                text: text_rx,
                tool_calls: tool_calls_rx,
                tool_results: tool_results_rx,
                steps: steps_rx,
                request: request_rx,
                response: response_rx,
                warnings: warnings_rx,
                provider_metadata: provider_metadata_rx,
                response_messages: response_messages_rx,
            },
        },
    )
}

/// Read-only view of the run's aggregate results.
///
/// Every getter waits for the run to finish. Usage is summed over all steps, text spans the
/// trailing chain of `continue` steps, everything else comes from the last step. When the run
/// fails the getters return the run's error.
#[derive(Clone)]
pub struct StreamTextAggregates {
    inner: AggregateResolvables,
}

impl StreamTextAggregates {
    pub async fn usage(&self) -> Result<Usage, StepflowError> {
        self.inner.usage.get().await
    }

    pub async fn finish_reason(&self) -> Result<FinishReason, StepflowError> {
        self.inner.finish_reason.get().await
    }

    pub async fn text(&self) -> Result<String, StepflowError> {
        self.inner.text.get().await
    }

    pub async fn tool_calls(&self) -> Result<Vec<ToolCall>, StepflowError> {
        self.inner.tool_calls.get().await
    }

    pub async fn tool_results(&self) -> Result<Vec<ToolResult>, StepflowError> {
        self.inner.tool_results.get().await
    }

    pub async fn steps(&self) -> Result<Vec<StepResult>, StepflowError> {
        self.inner.steps.get().await
    }

    pub async fn request(&self) -> Result<RequestMetadata, StepflowError> {
        self.inner.request.get().await
    }

    pub async fn response(&self) -> Result<StepResponse, StepflowError> {
        self.inner.response.get().await
    }

    pub async fn warnings(&self) -> Result<Vec<CallWarning>, StepflowError> {
        self.inner.warnings.get().await
    }

    pub async fn provider_metadata(&self) -> Result<Option<ProviderMetadata>, StepflowError> {
        self.inner.provider_metadata.get().await
    }

    pub async fn response_messages(&self) -> Result<Vec<Message>, StepflowError> {
        self.inner.response_messages.get().await
    }

    pub fn is_settled(&self) -> bool {
        self.inner.finish_reason.is_settled()
    }
}

/// Handle returned by [`crate::stream_text`].
///
/// The event stream can be read any number of times through [`Self::full_stream`] and
/// [`Self::text_stream`]; each reader sees every event from the start of the run.
pub struct StreamTextResult {
    hub: EventHub<TextStreamPart>,
    aggregates: StreamTextAggregates,
}

impl StreamTextResult {
    pub(crate) fn new(hub: EventHub<TextStreamPart>, aggregates: StreamTextAggregates) -> Self {
        Self { hub, aggregates }
    }

    pub fn full_stream(&self) -> EventFork<TextStreamPart> {
        self.hub.fork()
    }

    pub fn text_stream(&self) -> TextStream {
        TextStream {
            events: self.hub.fork(),
            finished: false,
        }
    }

    /// Drains the event stream so the run and its callbacks complete without a reader.
    pub async fn consume_stream(&self) -> Result<(), StepflowError> {
        let mut events = self.full_stream();
        while let Some(event) = events.next().await {
            event?;
        }
        Ok(())
    }

    /// Cancels the run; in-flight step streams are dropped and pending results are
    /// rejected as cancelled.
    pub fn cancel(&self) {
        self.hub.cancel();
    }

    pub fn aggregates(&self) -> StreamTextAggregates {
        self.aggregates.clone()
    }

    pub async fn usage(&self) -> Result<Usage, StepflowError> {
        self.aggregates.usage().await
    }

    pub async fn finish_reason(&self) -> Result<FinishReason, StepflowError> {
        self.aggregates.finish_reason().await
    }

    pub async fn text(&self) -> Result<String, StepflowError> {
        self.aggregates.text().await
    }

    pub async fn tool_calls(&self) -> Result<Vec<ToolCall>, StepflowError> {
        self.aggregates.tool_calls().await
    }

    pub async fn tool_results(&self) -> Result<Vec<ToolResult>, StepflowError> {
        self.aggregates.tool_results().await
    }

    pub async fn steps(&self) -> Result<Vec<StepResult>, StepflowError> {
        self.aggregates.steps().await
    }

    pub async fn request(&self) -> Result<RequestMetadata, StepflowError> {
        self.aggregates.request().await
    }

    pub async fn response(&self) -> Result<StepResponse, StepflowError> {
        self.aggregates.response().await
    }

    pub async fn warnings(&self) -> Result<Vec<CallWarning>, StepflowError> {
        self.aggregates.warnings().await
    }

    pub async fn provider_metadata(&self) -> Result<Option<ProviderMetadata>, StepflowError> {
        self.aggregates.provider_metadata().await
    }

    pub async fn response_messages(&self) -> Result<Vec<Message>, StepflowError> {
        self.aggregates.response_messages().await
    }
}

impl Drop for StreamTextResult {
    fn drop(&mut self) {
        self.hub.stop_retaining();
    }
}

/// Text payloads of the run's `text-delta` events.
///
/// An `error` event ends the stream with that error.
pub struct TextStream {
    events: EventFork<TextStreamPart>,
    finished: bool,
}

impl Stream for TextStream {
    type Item = Result<String, StepflowError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }
            match self.events.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(TextStreamPart::TextDelta { text_delta }))) => {
                    return Poll::Ready(Some(Ok(text_delta)));
                }
                Poll::Ready(Some(Ok(TextStreamPart::Error { error })))
                | Poll::Ready(Some(Err(error))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
