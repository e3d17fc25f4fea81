use stepflow_ai::{FinishReason, ToolCall, ToolResult};

use crate::types::StepKind;

/// Outcome of the continuation decision taken when a step finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Done,
    Continue,
    ToolResult,
}

impl NextStep {
    pub fn step_kind(self) -> Option<StepKind> {
        match self {
            NextStep::Done => None,
            NextStep::Continue => Some(StepKind::Continue),
            NextStep::ToolResult => Some(StepKind::ToolResult),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NextStep::Done => "done",
            NextStep::Continue => "continue",
            NextStep::ToolResult => "tool-result",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContinuationInput<'a> {
    pub step_index: usize,
    pub max_steps: usize,
    pub continue_steps: bool,
    pub finish_reason: FinishReason,
    pub tool_calls: &'a [ToolCall],
    pub tool_results: &'a [ToolResult],
}

/// Decides whether the run stops or issues another model call.
///
/// The step ceiling wins over everything. A truncated step without tool calls continues when
/// continuation is enabled; a step whose tool calls all have results triggers a tool-result
/// step. Tool calls that never produced a result end the run.
pub fn decide_next_step(input: &ContinuationInput<'_>) -> NextStep {
    if input.step_index + 1 >= input.max_steps {
        return NextStep::Done;
    }
    if input.continue_steps
        && input.finish_reason == FinishReason::Length
        && input.tool_calls.is_empty()
    {
        return NextStep::Continue;
    }
    if !input.tool_calls.is_empty()
        && all_tool_calls_resolved(input.tool_calls, input.tool_results)
    {
        return NextStep::ToolResult;
    }
    NextStep::Done
}

fn all_tool_calls_resolved(tool_calls: &[ToolCall], tool_results: &[ToolResult]) -> bool {
    tool_calls.iter().all(|call| {
        tool_results
            .iter()
            .any(|result| result.tool_call_id == call.tool_call_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            tool_call_id: id.to_string(),
            tool_name: "lookup".to_string(),
            args: json!({}),
        }
    }

    fn result(id: &str) -> ToolResult {
        ToolResult {
            tool_call_id: id.to_string(),
            tool_name: "lookup".to_string(),
            args: json!({}),
            result: json!("ok"),
        }
    }

    fn input<'a>(
        step_index: usize,
        finish_reason: FinishReason,
        tool_calls: &'a [ToolCall],
        tool_results: &'a [ToolResult],
    ) -> ContinuationInput<'a> {
        ContinuationInput {
            step_index,
            max_steps: 5,
            continue_steps: true,
            finish_reason,
            tool_calls,
            tool_results,
        }
    }

    #[test]
    fn truncated_step_without_tool_calls_continues() {
        assert_eq!(
            decide_next_step(&input(0, FinishReason::Length, &[], &[])),
            NextStep::Continue
        );
    }

    #[test]
    fn truncation_does_not_continue_when_disabled() {
        let mut decision = input(0, FinishReason::Length, &[], &[]);
        decision.continue_steps = false;

        assert_eq!(decide_next_step(&decision), NextStep::Done);
    }

    #[test]
    fn resolved_tool_calls_trigger_a_tool_result_step() {
        let calls = [call("a"), call("b")];
        let results = [result("b"), result("a")];

        assert_eq!(
            decide_next_step(&input(1, FinishReason::ToolCalls, &calls, &results)),
            NextStep::ToolResult
        );
    }

    #[test]
    fn tool_calls_block_continuation_even_when_truncated() {
        let calls = [call("a")];
        let results = [result("a")];

        assert_eq!(
            decide_next_step(&input(0, FinishReason::Length, &calls, &results)),
            NextStep::ToolResult
        );
        assert_eq!(
            decide_next_step(&input(0, FinishReason::Length, &calls, &[])),
            NextStep::Done
        );
    }

    #[test]
    fn unresolved_tool_calls_end_the_run() {
        let calls = [call("a"), call("b")];
        let results = [result("a"), result("c")];

        assert_eq!(
            decide_next_step(&input(0, FinishReason::ToolCalls, &calls, &results)),
            NextStep::Done
        );
    }

    #[test]
    fn step_ceiling_always_ends_the_run() {
        let calls = [call("a")];
        let results = [result("a")];

        assert_eq!(
            decide_next_step(&input(4, FinishReason::Length, &[], &[])),
            NextStep::Done
        );
        assert_eq!(
            decide_next_step(&input(4, FinishReason::ToolCalls, &calls, &results)),
            NextStep::Done
        );
    }

    #[test]
    fn next_step_maps_to_step_kinds() {
        assert_eq!(NextStep::Done.step_kind(), None);
        assert_eq!(NextStep::Continue.step_kind(), Some(StepKind::Continue));
        assert_eq!(NextStep::ToolResult.step_kind(), Some(StepKind::ToolResult));
    }
}
