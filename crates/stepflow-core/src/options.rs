use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepflow_ai::{
    AbortSignal, CallSettings, LanguageModelRef, Message, PromptFormat, ProviderMetadata,
    RetryPolicy, StepflowError, StepflowErrorCode, ToolChoice, DEFAULT_INITIAL_RETRY_DELAY_MS,
    DEFAULT_RETRY_BACKOFF_FACTOR,
};

use crate::tools::{Tool, ToolSet};
use crate::types::{
    ChunkCallback, FinishCallback, OnChunkFn, OnFinishFn, OnStepFinishFn, StepFinishCallback,
};

pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;
pub type IdGeneratorFn = Arc<dyn Fn() -> String + Send + Sync>;
pub type CurrentDateFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const RESPONSE_ID_PREFIX: &str = "aitxt-";
const RESPONSE_ID_LENGTH: usize = 24;

/// Clock, id generator and date source used by a run.
#[derive(Clone)]
pub struct RunEnvironment {
    /// Milliseconds, used for step timings.
    pub now: ClockFn,
    /// Seeds each step's response id.
    pub generate_id: IdGeneratorFn,
    /// Seeds each step's response timestamp.
    pub current_date: CurrentDateFn,
}

impl Default for RunEnvironment {
    fn default() -> Self {
        Self {
            now: Arc::new(|| Utc::now().timestamp_millis().max(0) as u64),
            generate_id: Arc::new(default_response_id),
            current_date: Arc::new(Utc::now),
        }
    }
}

fn default_response_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{RESPONSE_ID_PREFIX}{}", &random[..RESPONSE_ID_LENGTH])
}

fn default_max_steps() -> usize {
    1
}

/// Run settings that can be loaded from configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTextSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub continue_steps: bool,
    #[serde(default)]
    pub tool_call_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tools: Option<Vec<String>>,
    #[serde(flatten)]
    pub call: CallSettings,
}

impl Default for StreamTextSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            continue_steps: false,
            tool_call_streaming: false,
            active_tools: None,
            call: CallSettings::default(),
        }
    }
}

/// Parameters of a single [`crate::stream_text`] run.
#[derive(Clone)]
pub struct StreamTextOptions {
    pub model: LanguageModelRef,
    pub system: Option<String>,
    pub prompt: Option<String>,
    pub messages: Option<Vec<Message>>,
    pub tools: ToolSet,
    pub tool_choice: Option<ToolChoice>,
    pub active_tools: Option<Vec<String>>,
    pub settings: CallSettings,
    pub max_steps: usize,
    pub continue_steps: bool,
    pub tool_call_streaming: bool,
    pub headers: HashMap<String, String>,
    pub abort_signal: Option<AbortSignal>,
    pub provider_metadata: Option<ProviderMetadata>,
    /// Delay before the first retry of a failed model call; retries back off exponentially.
    pub retry_initial_delay_ms: u64,
    pub on_chunk: Option<OnChunkFn>,
    pub on_step_finish: Option<OnStepFinishFn>,
    pub on_finish: Option<OnFinishFn>,
    pub environment: RunEnvironment,
}

impl StreamTextOptions {
    pub fn new(model: LanguageModelRef) -> Self {
        Self {
            model,
            system: None,
            prompt: None,
            messages: None,
            tools: ToolSet::new(),
            tool_choice: None,
            active_tools: None,
            settings: CallSettings::default(),
            max_steps: default_max_steps(),
            continue_steps: false,
            tool_call_streaming: false,
            headers: HashMap::new(),
            abort_signal: None,
            provider_metadata: None,
            retry_initial_delay_ms: DEFAULT_INITIAL_RETRY_DELAY_MS,
            on_chunk: None,
            on_step_finish: None,
            on_finish: None,
            environment: RunEnvironment::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, tool: Tool) -> Self {
        self.tools.insert(name.into(), tool);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_continue_steps(mut self, continue_steps: bool) -> Self {
        self.continue_steps = continue_steps;
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    pub fn with_environment(mut self, environment: RunEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Applies loaded settings over the current values.
    pub fn with_settings(mut self, settings: StreamTextSettings) -> Self {
        self.max_steps = settings.max_steps;
        self.continue_steps = settings.continue_steps;
        self.tool_call_streaming = settings.tool_call_streaming;
        if settings.active_tools.is_some() {
            self.active_tools = settings.active_tools;
        }
        self.settings = settings.call;
        self
    }

    pub fn on_chunk<C>(mut self, callback: C) -> Self
    where
        C: ChunkCallback + 'static,
    {
        self.on_chunk = Some(Arc::new(callback));
        self
    }

    pub fn on_step_finish<C>(mut self, callback: C) -> Self
    where
        C: StepFinishCallback + 'static,
    {
        self.on_step_finish = Some(Arc::new(callback));
        self
    }

    pub fn on_finish<C>(mut self, callback: C) -> Self
    where
        C: FinishCallback + 'static,
    {
        self.on_finish = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<(), StepflowError> {
        if self.max_steps < 1 {
            return Err(StepflowError::invalid_argument(
                "maxSteps",
                Value::from(self.max_steps),
                "maxSteps must be at least 1",
            ));
        }
        self.settings.validate()?;
        match (&self.prompt, &self.messages) {
            (None, None) => Err(StepflowError::new(
                StepflowErrorCode::InvalidPrompt,
                "prompt or messages must be defined",
            )),
            (Some(_), Some(_)) => Err(StepflowError::new(
                StepflowErrorCode::InvalidPrompt,
                "prompt and messages cannot be defined at the same time",
            )),
            (None, Some(messages)) if messages.is_empty() => Err(StepflowError::new(
                StepflowErrorCode::InvalidPrompt,
                "messages must not be empty",
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.settings.max_retries,
            initial_delay_ms: self.retry_initial_delay_ms,
            backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
        }
    }

    /// Initial transcript: optional system message, then the prompt or the given messages.
    pub(crate) fn initial_transcript(&self) -> (PromptFormat, Vec<Message>) {
        let mut transcript = Vec::new();
        if let Some(system) = &self.system {
            transcript.push(Message::system(system.clone()));
        }
        match (&self.prompt, &self.messages) {
            (Some(prompt), _) => {
                transcript.push(Message::user_text(prompt.clone()));
                (PromptFormat::Prompt, transcript)
            }
            (None, messages) => {
                transcript.extend(messages.iter().flatten().cloned());
                (PromptFormat::Messages, transcript)
            }
        }
    }
}
