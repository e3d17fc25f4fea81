//! Tool set and the per-step tool execution stage.
//!
//! [`run_tools`] sits between a model's raw stream and the step transformer: it parses tool
//! calls against the tool set, starts executions concurrently and holds the model's `finish`
//! back until every execution has reported its outcome.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use serde_json::{json, Value};
use stepflow_ai::{
    AbortSignal, FinishReason, LanguageModelStreamPart, LogProbs, ProviderMetadata, RawPartStream,
    StepflowError, StepflowErrorCode, ToolCall, ToolResult, ToolSpec, Usage,
};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct ToolExecutionContext {
    pub tool_call_id: String,
    pub abort_signal: Option<AbortSignal>,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, StepflowError>> + Send>>;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        args: Value,
        context: ToolExecutionContext,
    ) -> Result<Value, StepflowError>;
}

#[async_trait]
impl<F> ToolExecutor for F
where
    F: Fn(Value, ToolExecutionContext) -> ToolFuture + Send + Sync + 'static,
{
    async fn execute(
        &self,
        args: Value,
        context: ToolExecutionContext,
    ) -> Result<Value, StepflowError> {
        (self)(args, context).await
    }
}

pub type ToolExecuteFn = Arc<dyn ToolExecutor>;

#[derive(Clone)]
pub struct Tool {
    pub description: Option<String>,
    pub parameters: Value,
    /// Tools without an execution function only surface their calls.
    pub execute: Option<ToolExecuteFn>,
}

impl Tool {
    pub fn new(parameters: Value) -> Self {
        Self {
            description: None,
            parameters,
            execute: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_execute<E>(mut self, execute: E) -> Self
    where
        E: ToolExecutor + 'static,
    {
        self.execute = Some(Arc::new(execute));
        self
    }
}

pub type ToolSet = BTreeMap<String, Tool>;

/// Specifications sent to the model, restricted to `active_tools` when given.
pub fn tool_specs(tools: &ToolSet, active_tools: Option<&[String]>) -> Vec<ToolSpec> {
    tools
        .iter()
        .filter(|(name, _)| {
            active_tools.map_or(true, |active| active.iter().any(|allowed| allowed == *name))
        })
        .map(|(name, tool)| ToolSpec {
            name: name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        })
        .collect()
}

/// Event of a single model call after tool handling.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStreamPart {
    TextDelta(String),
    ToolCall(ToolCall),
    ToolCallStreamingStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolCallDelta {
        tool_call_id: String,
        tool_name: String,
        args_text_delta: String,
    },
    ToolResult(ToolResult),
    ResponseMetadata {
        id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        model_id: Option<String>,
    },
    Finish {
        finish_reason: FinishReason,
        usage: Usage,
        provider_metadata: Option<ProviderMetadata>,
        logprobs: Option<LogProbs>,
    },
    Error(StepflowError),
}

pub fn run_tools(
    upstream: RawPartStream,
    tools: Arc<ToolSet>,
    tool_call_streaming: bool,
    abort_signal: Option<AbortSignal>,
) -> ToolRunStream {
    ToolRunStream {
        upstream: Some(upstream),
        tools,
        tool_call_streaming,
        abort_signal,
        streaming_calls: HashSet::new(),
        executions: FuturesUnordered::new(),
        ready: VecDeque::new(),
        held_finish: None,
        done: false,
    }
}

pub struct ToolRunStream {
    upstream: Option<RawPartStream>,
    tools: Arc<ToolSet>,
    tool_call_streaming: bool,
    abort_signal: Option<AbortSignal>,
    streaming_calls: HashSet<String>,
    executions: FuturesUnordered<BoxFuture<'static, StepStreamPart>>,
    ready: VecDeque<StepStreamPart>,
    held_finish: Option<StepStreamPart>,
    done: bool,
}

impl ToolRunStream {
    fn accept(&mut self, part: LanguageModelStreamPart) {
        match part {
            LanguageModelStreamPart::TextDelta { text_delta } => {
                self.ready.push_back(StepStreamPart::TextDelta(text_delta));
            }
            LanguageModelStreamPart::ToolCallDelta {
                tool_call_id,
                tool_name,
                args_text_delta,
            } => {
                if !self.tool_call_streaming {
                    return;
                }
                if self.streaming_calls.insert(tool_call_id.clone()) {
                    self.ready.push_back(StepStreamPart::ToolCallStreamingStart {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                    });
                }
                self.ready.push_back(StepStreamPart::ToolCallDelta {
                    tool_call_id,
                    tool_name,
                    args_text_delta,
                });
            }
            LanguageModelStreamPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => self.accept_tool_call(tool_call_id, tool_name, args),
            LanguageModelStreamPart::ResponseMetadata {
                id,
                timestamp,
                model_id,
            } => {
                self.ready.push_back(StepStreamPart::ResponseMetadata {
                    id,
                    timestamp,
                    model_id,
                });
            }
            LanguageModelStreamPart::Finish {
                finish_reason,
                usage,
                provider_metadata,
                logprobs,
            } => {
                self.held_finish = Some(StepStreamPart::Finish {
                    finish_reason,
                    usage,
                    provider_metadata,
                    logprobs,
                });
            }
            LanguageModelStreamPart::Error { error } => {
                self.ready.push_back(StepStreamPart::Error(error));
            }
        }
    }

    fn accept_tool_call(&mut self, tool_call_id: String, tool_name: String, args: String) {
        let Some(tool) = self.tools.get(&tool_name) else {
            let available: Vec<&String> = self.tools.keys().collect();
            self.ready.push_back(StepStreamPart::Error(
                StepflowError::new(
                    StepflowErrorCode::NoSuchTool,
                    format!("Model tried to call unavailable tool '{tool_name}'."),
                )
                .with_details(json!({
                    "toolName": tool_name,
                    "availableTools": available,
                })),
            ));
            return;
        };

        let parsed = if args.trim().is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(&args)
        };
        let args = match parsed {
            Ok(value) => value,
            Err(error) => {
                self.ready.push_back(StepStreamPart::Error(
                    StepflowError::new(
                        StepflowErrorCode::InvalidToolArguments,
                        format!("Invalid arguments for tool {tool_name}: {error}"),
                    )
                    .with_details(json!({
                        "toolName": tool_name,
                        "toolArgs": args,
                    })),
                ));
                return;
            }
        };

        let call = ToolCall {
            tool_call_id,
            tool_name,
            args,
        };
        self.ready.push_back(StepStreamPart::ToolCall(call.clone()));

        if let Some(execute) = tool.execute.clone() {
            let context = ToolExecutionContext {
                tool_call_id: call.tool_call_id.clone(),
                abort_signal: self.abort_signal.clone(),
            };
            self.executions.push(execute_tool_call(execute, call, context).boxed());
        }
    }
}

async fn execute_tool_call(
    execute: ToolExecuteFn,
    call: ToolCall,
    context: ToolExecutionContext,
) -> StepStreamPart {
    match execute.execute(call.args.clone(), context).await {
        Ok(result) => {
            debug!(
                tool_call_id = call.tool_call_id.as_str(),
                tool_name = call.tool_name.as_str(),
                "tool execution finished"
            );
            StepStreamPart::ToolResult(ToolResult {
                tool_call_id: call.tool_call_id,
                tool_name: call.tool_name,
                args: call.args,
                result,
            })
        }
        Err(error) => {
            warn!(
                tool_call_id = call.tool_call_id.as_str(),
                tool_name = call.tool_name.as_str(),
                error_code = ?error.code,
                error = error.message.as_str(),
                "tool execution failed"
            );
            StepStreamPart::Error(
                StepflowError::new(
                    StepflowErrorCode::ToolExecutionFailed,
                    format!(
                        "Error executing tool {}: {}",
                        call.tool_name, error.message
                    ),
                )
                .with_details(json!({
                    "toolCallId": call.tool_call_id,
                    "toolName": call.tool_name,
                    "toolArgs": call.args,
                    "cause": error,
                })),
            )
        }
    }
}

impl Stream for ToolRunStream {
    type Item = Result<StepStreamPart, StepflowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(part) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(part)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            if !this.executions.is_empty() {
                if let Poll::Ready(Some(part)) = this.executions.poll_next_unpin(cx) {
                    return Poll::Ready(Some(Ok(part)));
                }
            }

            if let Some(upstream) = this.upstream.as_mut() {
                match upstream.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(part))) => {
                        this.accept(part);
                        continue;
                    }
                    Poll::Ready(Some(Err(error))) => {
                        this.done = true;
                        this.upstream = None;
                        this.executions = FuturesUnordered::new();
                        return Poll::Ready(Some(Err(error)));
                    }
                    Poll::Ready(None) => {
                        this.upstream = None;
                        continue;
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            if !this.executions.is_empty() {
                return Poll::Pending;
            }
            this.done = true;
            if let Some(finish) = this.held_finish.take() {
                return Poll::Ready(Some(Ok(finish)));
            }
            return Poll::Ready(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn echo_tool() -> Tool {
        Tool::new(json!({ "type": "object" }))
            .with_description("echoes its input")
            .with_execute(|args: Value, _context: ToolExecutionContext| -> ToolFuture {
                Box::pin(async move { Ok(json!({ "echo": args })) })
            })
    }

    fn tool_set() -> Arc<ToolSet> {
        let mut tools = ToolSet::new();
        tools.insert("echo".to_string(), echo_tool());
        tools.insert("manual".to_string(), Tool::new(json!({ "type": "object" })));
        Arc::new(tools)
    }

    fn raw(parts: Vec<LanguageModelStreamPart>) -> RawPartStream {
        stream::iter(parts.into_iter().map(Ok)).boxed()
    }

    fn tool_call(id: &str, name: &str, args: &str) -> LanguageModelStreamPart {
        LanguageModelStreamPart::ToolCall {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            args: args.to_string(),
        }
    }

    fn finish() -> LanguageModelStreamPart {
        LanguageModelStreamPart::Finish {
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::new(3, 4),
            provider_metadata: None,
            logprobs: None,
        }
    }

    async fn collect(stream: ToolRunStream) -> Vec<StepStreamPart> {
        stream
            .map(|item| item.expect("no stream errors expected"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn executed_tool_results_arrive_before_the_held_finish() {
        let parts = collect(run_tools(
            raw(vec![tool_call("c1", "echo", r#"{"value":1}"#), finish()]),
            tool_set(),
            false,
            None,
        ))
        .await;

        assert_eq!(parts.len(), 3);
        assert!(matches!(
            &parts[0],
            StepStreamPart::ToolCall(call) if call.args == json!({ "value": 1 })
        ));
        assert!(matches!(
            &parts[1],
            StepStreamPart::ToolResult(result) if result.result == json!({ "echo": { "value": 1 } })
        ));
        assert!(matches!(parts[2], StepStreamPart::Finish { .. }));
    }

    #[tokio::test]
    async fn tools_without_execute_only_surface_the_call() {
        let parts = collect(run_tools(
            raw(vec![tool_call("c1", "manual", ""), finish()]),
            tool_set(),
            false,
            None,
        ))
        .await;

        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], StepStreamPart::ToolCall(call) if call.args == json!({})));
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_arguments_become_error_events() {
        let parts = collect(run_tools(
            raw(vec![
                tool_call("c1", "missing", "{}"),
                tool_call("c2", "echo", "{not json"),
                finish(),
            ]),
            tool_set(),
            false,
            None,
        ))
        .await;

        let codes: Vec<StepflowErrorCode> = parts
            .iter()
            .filter_map(|part| match part {
                StepStreamPart::Error(error) => Some(error.code.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                StepflowErrorCode::NoSuchTool,
                StepflowErrorCode::InvalidToolArguments
            ]
        );
    }

    #[tokio::test]
    async fn failing_execution_becomes_an_error_event() {
        let mut tools = ToolSet::new();
        tools.insert(
            "broken".to_string(),
            Tool::new(json!({})).with_execute(
                |_args: Value, _context: ToolExecutionContext| -> ToolFuture {
                    Box::pin(async {
                        Err(StepflowError::new(StepflowErrorCode::ProviderHttp, "denied"))
                    })
                },
            ),
        );

        let parts = collect(run_tools(
            raw(vec![tool_call("c1", "broken", "{}"), finish()]),
            Arc::new(tools),
            false,
            None,
        ))
        .await;

        assert!(matches!(
            &parts[1],
            StepStreamPart::Error(error) if error.code == StepflowErrorCode::ToolExecutionFailed
        ));
    }

    #[tokio::test]
    async fn argument_deltas_require_tool_call_streaming() {
        let delta = |text: &str| LanguageModelStreamPart::ToolCallDelta {
            tool_call_id: "c1".to_string(),
            tool_name: "echo".to_string(),
            args_text_delta: text.to_string(),
        };

        let silent = collect(run_tools(
            raw(vec![delta("{"), delta("}")]),
            tool_set(),
            false,
            None,
        ))
        .await;
        let streamed = collect(run_tools(
            raw(vec![delta("{"), delta("}")]),
            tool_set(),
            true,
            None,
        ))
        .await;

        assert!(silent.is_empty());
        assert_eq!(streamed.len(), 3);
        assert!(matches!(
            streamed[0],
            StepStreamPart::ToolCallStreamingStart { .. }
        ));
        assert!(matches!(streamed[2], StepStreamPart::ToolCallDelta { .. }));
    }

    #[test]
    fn active_tools_filter_the_specifications() {
        let tools = tool_set();
        let active = vec!["manual".to_string()];

        let all = tool_specs(&tools, None);
        let filtered = tool_specs(&tools, Some(&active));

        assert_eq!(all.len(), 2);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "manual");
    }
}
