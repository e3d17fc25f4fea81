use std::sync::Arc;

use futures_util::stream::StreamExt;
use stepflow_ai::{stitchable_stream, EventHub, StepflowError, Usage};

use crate::options::StreamTextOptions;
use crate::result::{aggregate_channels, StreamTextResult};
use crate::run::{step_stream, RunCallbacks, RunConfig, RunShared, StepLaunch};
use crate::tools::tool_specs;
use crate::types::StepKind;
use crate::whitespace::WhitespaceCarry;

/// Starts a multi-step streaming run.
///
/// Options are validated and the first model call is made before returning, so configuration
/// errors and a failing first call surface here. Later steps are driven by reading the
/// returned result's streams.
pub async fn stream_text(options: StreamTextOptions) -> Result<StreamTextResult, StepflowError> {
    options.validate()?;

    let (input_format, transcript) = options.initial_transcript();
    let retry = options.retry_policy();
    let StreamTextOptions {
        model,
        tools,
        tool_choice,
        active_tools,
        settings,
        max_steps,
        continue_steps,
        tool_call_streaming,
        headers,
        abort_signal,
        provider_metadata,
        on_chunk,
        on_step_finish,
        on_finish,
        environment,
        ..
    } = options;

    let config = RunConfig {
        max_steps,
        continue_steps,
        tool_call_streaming,
        tool_specs: tool_specs(&tools, active_tools.as_deref()),
        tool_choice,
        settings,
        headers,
        provider_metadata,
        abort_signal,
        retry,
    };
    let callbacks = RunCallbacks {
        on_chunk,
        on_step_finish,
        on_finish,
    };

    let (output, handle) = stitchable_stream();
    let (resolvers, aggregates) = aggregate_channels();
    let shared = Arc::new(RunShared::new(
        model,
        tools,
        config,
        callbacks,
        environment,
        handle.clone(),
        resolvers,
    ));

    let started_at = shared.now();
    let response = shared
        .call_model(0, StepKind::Initial, input_format, transcript.clone())
        .await?;
    handle.append(step_stream(
        shared,
        StepLaunch {
            index: 0,
            kind: StepKind::Initial,
            transcript,
            usage_so_far: Usage::default(),
            previous_text: String::new(),
            carry: WhitespaceCarry::default(),
            response,
            started_at,
        },
    ))?;

    Ok(StreamTextResult::new(EventHub::new(output.boxed()), aggregates))
}
