//! Multi-step streaming text orchestration built on top of `stepflow-ai`.

mod continuation;
mod messages;
mod options;
mod result;
mod run;
mod stream_text;
mod tools;
mod types;
mod whitespace;

pub use continuation::{decide_next_step, ContinuationInput, NextStep};
pub use messages::{append_continuation, to_response_messages};
pub use options::{
    ClockFn, CurrentDateFn, IdGeneratorFn, RunEnvironment, StreamTextOptions, StreamTextSettings,
};
pub use result::{StreamTextAggregates, StreamTextResult, TextStream};
pub use stream_text::stream_text;
pub use tools::{
    run_tools, tool_specs, StepStreamPart, Tool, ToolExecuteFn, ToolExecutionContext,
    ToolExecutor, ToolFuture, ToolRunStream, ToolSet,
};
pub use types::{
    CallbackFuture, ChunkCallback, FinishCallback, FinishEvent, OnChunkFn, OnFinishFn,
    OnStepFinishFn, StepFinishCallback, StepKind, StepResponse, StepResult,
};
pub use whitespace::{split_on_last_whitespace, TextSegmenter, WhitespaceCarry};
