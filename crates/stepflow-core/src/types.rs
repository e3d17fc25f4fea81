use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepflow_ai::{
    CallWarning, FinishReason, LogProbs, Message, ProviderMetadata, RequestMetadata,
    ResponseMetadata, StepflowError, TextStreamPart, ToolCall, ToolResult, Usage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "initial")]
    Initial,
    #[serde(rename = "continue")]
    Continue,
    #[serde(rename = "tool-result")]
    ToolResult,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Initial => "initial",
            StepKind::Continue => "continue",
            StepKind::ToolResult => "tool-result",
        }
    }
}

/// Response metadata of a finished step together with the transcript it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "modelId")]
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub headers: Option<HashMap<String, String>>,
    /// Response messages of the run up to and including this step.
    pub messages: Vec<Message>,
}

impl StepResponse {
    pub fn metadata(&self) -> ResponseMetadata {
        ResponseMetadata {
            id: self.id.clone(),
            timestamp: self.timestamp,
            model_id: self.model_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(rename = "stepType")]
    pub step_type: StepKind,
    pub text: String,
    #[serde(rename = "toolCalls")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(rename = "toolResults")]
    pub tool_results: Vec<ToolResult>,
    #[serde(rename = "finishReason")]
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub warnings: Vec<CallWarning>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub logprobs: Option<LogProbs>,
    pub request: RequestMetadata,
    pub response: StepResponse,
    #[serde(
        rename = "providerMetadata",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub provider_metadata: Option<ProviderMetadata>,
    #[serde(rename = "isContinued")]
    pub is_continued: bool,
}

/// Everything known when the run finishes: last-step values, usage summed over every step.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishEvent {
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub request: RequestMetadata,
    pub response: StepResponse,
    pub warnings: Vec<CallWarning>,
    pub provider_metadata: Option<ProviderMetadata>,
    pub logprobs: Option<LogProbs>,
    pub steps: Vec<StepResult>,
}

pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), StepflowError>> + Send>>;

#[async_trait]
pub trait ChunkCallback: Send + Sync {
    async fn on_chunk(&self, chunk: TextStreamPart) -> Result<(), StepflowError>;
}

#[async_trait]
impl<F> ChunkCallback for F
where
    F: Fn(TextStreamPart) -> CallbackFuture + Send + Sync + 'static,
{
    async fn on_chunk(&self, chunk: TextStreamPart) -> Result<(), StepflowError> {
        (self)(chunk).await
    }
}

pub type OnChunkFn = Arc<dyn ChunkCallback>;

#[async_trait]
pub trait StepFinishCallback: Send + Sync {
    async fn on_step_finish(&self, step: StepResult) -> Result<(), StepflowError>;
}

#[async_trait]
impl<F> StepFinishCallback for F
where
    F: Fn(StepResult) -> CallbackFuture + Send + Sync + 'static,
{
    async fn on_step_finish(&self, step: StepResult) -> Result<(), StepflowError> {
        (self)(step).await
    }
}

pub type OnStepFinishFn = Arc<dyn StepFinishCallback>;

#[async_trait]
pub trait FinishCallback: Send + Sync {
    async fn on_finish(&self, event: FinishEvent) -> Result<(), StepflowError>;
}

#[async_trait]
impl<F> FinishCallback for F
where
    F: Fn(FinishEvent) -> CallbackFuture + Send + Sync + 'static,
{
    async fn on_finish(&self, event: FinishEvent) -> Result<(), StepflowError> {
        (self)(event).await
    }
}

pub type OnFinishFn = Arc<dyn FinishCallback>;
