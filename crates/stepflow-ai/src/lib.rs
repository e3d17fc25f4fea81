//! Provider-agnostic vocabulary and stream primitives for multi-step LLM streaming.

mod abort;
mod error;
mod fork;
mod model;
mod resolvable;
mod retry;
mod stitch;
mod types;

pub use abort::{AbortController, AbortSignal};
pub use error::{StepflowError, StepflowErrorCode};
pub use fork::{EventFork, EventHub};
pub use model::{
    CallOptions, ClosureLanguageModel, LanguageModel, LanguageModelRef, ModelFuture,
    ModelStreamFunction, ModelStreamResponse, RawPartStream,
};
pub use resolvable::{resolvable, Resolvable, Resolver};
pub use retry::{
    retry_with_exponential_backoff, RetryPolicy, DEFAULT_INITIAL_RETRY_DELAY_MS,
    DEFAULT_RETRY_BACKOFF_FACTOR,
};
pub use stitch::{stitchable_stream, StitchHandle, StitchSource, StitchableStream};
pub use types::{
    AssistantContentPart, CallSettings, CallWarning, FinishReason, LanguageModelStreamPart,
    LogProb, LogProbs, Message, PromptFormat, ProviderMetadata, RawResponse, RequestMetadata,
    ResponseMetadata, TextStreamPart, ToolCall, ToolChoice, ToolResult, ToolResultPart, ToolSpec,
    TopLogProb, Usage, UserContentPart, DEFAULT_MAX_RETRIES,
};
