use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::abort::AbortSignal;
use crate::error::StepflowError;
use crate::types::{
    CallSettings, CallWarning, LanguageModelStreamPart, Message, PromptFormat, ProviderMetadata,
    RawResponse, RequestMetadata, ToolChoice, ToolSpec,
};

pub type RawPartStream = BoxStream<'static, Result<LanguageModelStreamPart, StepflowError>>;

/// Everything a single model invocation receives.
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub input_format: PromptFormat,
    pub prompt: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    pub settings: CallSettings,
    pub headers: HashMap<String, String>,
    pub provider_metadata: Option<ProviderMetadata>,
    pub abort_signal: Option<AbortSignal>,
}

pub struct ModelStreamResponse {
    pub stream: RawPartStream,
    pub warnings: Vec<CallWarning>,
    pub request: RequestMetadata,
    pub raw_response: RawResponse,
}

impl ModelStreamResponse {
    pub fn new(stream: RawPartStream) -> Self {
        Self {
            stream,
            warnings: Vec::new(),
            request: RequestMetadata::default(),
            raw_response: RawResponse::default(),
        }
    }
}

/// The model-call capability. Implementations own transport and provider shaping.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> &str;
    fn model_id(&self) -> &str;
    async fn do_stream(&self, options: CallOptions) -> Result<ModelStreamResponse, StepflowError>;
}

pub type LanguageModelRef = Arc<dyn LanguageModel>;

pub type ModelFuture =
    Pin<Box<dyn Future<Output = Result<ModelStreamResponse, StepflowError>> + Send>>;

pub type ModelStreamFunction = Arc<dyn Fn(CallOptions) -> ModelFuture + Send + Sync>;

#[derive(Clone)]
pub struct ClosureLanguageModel {
    pub provider: String,
    pub model_id: String,
    pub stream: ModelStreamFunction,
}

impl ClosureLanguageModel {
    pub fn new<F, Fut>(provider: impl Into<String>, model_id: impl Into<String>, stream: F) -> Self
    where
        F: Fn(CallOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ModelStreamResponse, StepflowError>> + Send + 'static,
    {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            stream: Arc::new(move |options| Box::pin(stream(options))),
        }
    }
}

#[async_trait]
impl LanguageModel for ClosureLanguageModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn do_stream(&self, options: CallOptions) -> Result<ModelStreamResponse, StepflowError> {
        (self.stream)(options).await
    }
}
