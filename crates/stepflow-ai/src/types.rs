use std::collections::HashMap;
use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StepflowError;

/// Provider-specific metadata keyed by provider name.
pub type ProviderMetadata = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FinishReason {
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "length")]
    Length,
    #[serde(rename = "content-filter")]
    ContentFilter,
    #[serde(rename = "tool-calls")]
    ToolCalls,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "other")]
    Other,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(rename = "promptTokens")]
    pub prompt_tokens: u64,
    #[serde(rename = "completionTokens")]
    pub completion_tokens: u64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self
                .completion_tokens
                .saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        *self = *self + other;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopLogProb {
    pub token: String,
    pub logprob: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogProb {
    pub token: String,
    pub logprob: f64,
    #[serde(rename = "topLogprobs", default)]
    pub top_logprobs: Vec<TopLogProb>,
}

pub type LogProbs = Vec<LogProb>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "modelId")]
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CallWarning {
    #[serde(rename = "unsupported-setting")]
    UnsupportedSetting {
        setting: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    #[serde(rename = "unsupported-tool")]
    UnsupportedTool {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    #[serde(rename = "other")]
    Other { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub args: Value,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UserContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool-call")]
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        args: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub result: Value,
}

/// One transcript entry sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: Vec<UserContentPart> },
    #[serde(rename = "assistant")]
    Assistant { content: Vec<AssistantContentPart> },
    #[serde(rename = "tool")]
    Tool { content: Vec<ToolResultPart> },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System {
            content: text.into(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User {
            content: vec![UserContentPart::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant {
            content: vec![AssistantContentPart::Text { text: text.into() }],
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Tool { .. } => "tool",
        }
    }
}

/// Tool description handed to the model; execution lives with the caller's tool set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "none")]
    None,
    #[serde(rename = "required")]
    Required,
    #[serde(rename = "tool")]
    Tool {
        #[serde(rename = "toolName")]
        tool_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptFormat {
    #[serde(rename = "prompt")]
    Prompt,
    #[serde(rename = "messages")]
    Messages,
}

pub const DEFAULT_MAX_RETRIES: usize = 2;

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSettings {
    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none", default)]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f64>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none", default)]
    pub top_p: Option<f64>,
    #[serde(rename = "topK", skip_serializing_if = "Option::is_none", default)]
    pub top_k: Option<u32>,
    #[serde(
        rename = "presencePenalty",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub presence_penalty: Option<f64>,
    #[serde(
        rename = "frequencyPenalty",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub frequency_penalty: Option<f64>,
    #[serde(rename = "stopSequences", skip_serializing_if = "Option::is_none", default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seed: Option<i64>,
    #[serde(rename = "maxRetries", default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            presence_penalty: None,
            frequency_penalty: None,
            stop_sequences: None,
            seed: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl CallSettings {
    pub fn validate(&self) -> Result<(), StepflowError> {
        if let Some(max_tokens) = self.max_tokens {
            if max_tokens < 1 {
                return Err(StepflowError::invalid_argument(
                    "maxTokens",
                    Value::from(max_tokens),
                    "maxTokens must be at least 1",
                ));
            }
        }
        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() {
                return Err(StepflowError::invalid_argument(
                    "temperature",
                    Value::Null,
                    "temperature must be a finite number",
                ));
            }
        }
        Ok(())
    }
}

/// Event emitted by a single model call, before tool handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LanguageModelStreamPart {
    #[serde(rename = "text-delta")]
    TextDelta {
        #[serde(rename = "textDelta")]
        text_delta: String,
    },
    #[serde(rename = "tool-call")]
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        /// JSON-encoded arguments as produced by the model.
        args: String,
    },
    #[serde(rename = "tool-call-delta")]
    ToolCallDelta {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "argsTextDelta")]
        args_text_delta: String,
    },
    #[serde(rename = "response-metadata")]
    ResponseMetadata {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(rename = "modelId", skip_serializing_if = "Option::is_none", default)]
        model_id: Option<String>,
    },
    #[serde(rename = "finish")]
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        usage: Usage,
        #[serde(
            rename = "providerMetadata",
            skip_serializing_if = "Option::is_none",
            default
        )]
        provider_metadata: Option<ProviderMetadata>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        logprobs: Option<LogProbs>,
    },
    #[serde(rename = "error")]
    Error { error: StepflowError },
}

/// Event on the merged multi-step stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TextStreamPart {
    #[serde(rename = "text-delta")]
    TextDelta {
        #[serde(rename = "textDelta")]
        text_delta: String,
    },
    #[serde(rename = "tool-call")]
    ToolCall(ToolCall),
    #[serde(rename = "tool-call-streaming-start")]
    ToolCallStreamingStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    #[serde(rename = "tool-call-delta")]
    ToolCallDelta {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "argsTextDelta")]
        args_text_delta: String,
    },
    #[serde(rename = "tool-result")]
    ToolResult(ToolResult),
    #[serde(rename = "step-finish")]
    StepFinish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        usage: Usage,
        #[serde(rename = "providerMetadata", skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<ProviderMetadata>,
        #[serde(skip_serializing_if = "Option::is_none")]
        logprobs: Option<LogProbs>,
        response: ResponseMetadata,
        #[serde(rename = "isContinued")]
        is_continued: bool,
    },
    #[serde(rename = "finish")]
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        usage: Usage,
        #[serde(rename = "providerMetadata", skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<ProviderMetadata>,
        #[serde(skip_serializing_if = "Option::is_none")]
        logprobs: Option<LogProbs>,
        response: ResponseMetadata,
    },
    #[serde(rename = "error")]
    Error { error: StepflowError },
}

impl TextStreamPart {
    pub fn kind(&self) -> &'static str {
        match self {
            TextStreamPart::TextDelta { .. } => "text-delta",
            TextStreamPart::ToolCall(_) => "tool-call",
            TextStreamPart::ToolCallStreamingStart { .. } => "tool-call-streaming-start",
            TextStreamPart::ToolCallDelta { .. } => "tool-call-delta",
            TextStreamPart::ToolResult(_) => "tool-result",
            TextStreamPart::StepFinish { .. } => "step-finish",
            TextStreamPart::Finish { .. } => "finish",
            TextStreamPart::Error { .. } => "error",
        }
    }

    /// Parts that are forwarded to the per-chunk callback.
    pub fn is_chunk(&self) -> bool {
        matches!(
            self,
            TextStreamPart::TextDelta { .. }
                | TextStreamPart::ToolCall(_)
                | TextStreamPart::ToolCallStreamingStart { .. }
                | TextStreamPart::ToolCallDelta { .. }
                | TextStreamPart::ToolResult(_)
        )
    }
}
