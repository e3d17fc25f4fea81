use stepflow_ai::{AssistantContentPart, Message, ToolCall, ToolResult, ToolResultPart};

/// Assistant and tool messages describing one finished step.
///
/// The assistant message carries the step text (when non-empty) followed by its tool calls;
/// a tool message follows only when results exist.
pub fn to_response_messages(
    text: &str,
    tool_calls: &[ToolCall],
    tool_results: &[ToolResult],
) -> Vec<Message> {
    let mut content = Vec::with_capacity(tool_calls.len() + 1);
    if !text.is_empty() {
        content.push(AssistantContentPart::Text {
            text: text.to_string(),
        });
    }
    content.extend(tool_calls.iter().map(|call| AssistantContentPart::ToolCall {
        tool_call_id: call.tool_call_id.clone(),
        tool_name: call.tool_name.clone(),
        args: call.args.clone(),
    }));

    let mut messages = vec![Message::Assistant { content }];
    if !tool_results.is_empty() {
        messages.push(Message::Tool {
            content: tool_results
                .iter()
                .map(|result| ToolResultPart {
                    tool_call_id: result.tool_call_id.clone(),
                    tool_name: result.tool_name.clone(),
                    result: result.result.clone(),
                })
                .collect(),
        });
    }
    messages
}

/// Extends the trailing assistant message with the text of a `continue` step.
///
/// Continue steps never carry tool calls, so the last message is the assistant message of the
/// step being continued; a new assistant message is started if that is not the case.
pub fn append_continuation(messages: &mut Vec<Message>, text: &str) {
    if text.is_empty() {
        return;
    }
    let part = AssistantContentPart::Text {
        text: text.to_string(),
    };
    match messages.last_mut() {
        Some(Message::Assistant { content }) => content.push(part),
        _ => messages.push(Message::Assistant {
            content: vec![part],
        }),
    }
}
