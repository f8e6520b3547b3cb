//! OpenAI chunk → 统一 chunk

use super::{ChatCompletionChunk, ChunkDelta, OpenAIStreamEvent, ToolCallChunk};
use crate::error::{Error, Result};
use crate::protocol::NativeEvent;
use crate::session::{Phase, SessionState};
use crate::unified::{
    ChoiceDelta, ContentPart, FinishReason, Role, ToolCallDelta, UnifiedStreamChunk, UnifiedUsage,
};
use tracing::{debug, error};

pub fn normalize(event: &NativeEvent, state: &mut SessionState) -> Result<Option<UnifiedStreamChunk>> {
    let NativeEvent::OpenAI(event) = event else {
        return Err(Error::MalformedNativeEvent(format!(
            "expected openai event, got {}",
            event.protocol()
        )));
    };

    match event {
        OpenAIStreamEvent::Done => {
            debug!("openai stream reached [DONE]");
            state.advance(Phase::Finished);
            Ok(None)
        }
        OpenAIStreamEvent::Chunk(chunk) => normalize_chunk(chunk, state),
        OpenAIStreamEvent::Error(body) => {
            error!(
                error_type = %body.error.error_type,
                message = %body.error.message,
                "openai stream reported an error"
            );
            Ok(None)
        }
    }
}

fn normalize_chunk(
    chunk: &ChatCompletionChunk,
    state: &mut SessionState,
) -> Result<Option<UnifiedStreamChunk>> {
    if state.is_finished() {
        return Err(Error::ProtocolInvariantViolation(format!(
            "chunk {} after [DONE]",
            chunk.id
        )));
    }

    if state.message_id().is_none() {
        if chunk.created != 0 {
            state.set_created(chunk.created);
        }
        state.start_message(chunk.id.clone(), chunk.model.clone());
    }

    let choices: Vec<ChoiceDelta> = chunk
        .choices
        .iter()
        .map(|choice| {
            let mut delta = map_delta(choice.index, &choice.delta);
            delta.finish_reason = choice
                .finish_reason
                .as_deref()
                .filter(|reason| !reason.is_empty())
                .map(FinishReason::from);
            delta
        })
        .collect();

    if choices.iter().any(|c| c.finish_reason.is_some()) {
        state.advance(Phase::Finishing);
    }

    let usage = chunk.usage.map(|usage| UnifiedUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage
            .total_tokens
            .unwrap_or(usage.prompt_tokens.saturating_add(usage.completion_tokens)),
    });

    if choices.is_empty() && usage.is_none() {
        return Ok(None);
    }

    Ok(Some(UnifiedStreamChunk {
        id: state.message_id().unwrap_or(&chunk.id).to_string(),
        model: state.model().unwrap_or(&chunk.model).to_string(),
        created: state.created(),
        choices,
        usage,
    }))
}

fn map_delta(index: u32, delta: &ChunkDelta) -> ChoiceDelta {
    let mut content = Vec::new();
    if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
        content.push(ContentPart::text(text));
    }
    if let Some(refusal) = delta.refusal.as_deref().filter(|r| !r.is_empty()) {
        content.push(ContentPart::Refusal {
            refusal: refusal.to_string(),
        });
    }

    let reasoning = delta
        .reasoning_content
        .as_deref()
        .or(delta.reasoning.as_deref())
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    ChoiceDelta {
        index,
        role: delta.role.as_deref().map(map_role),
        content,
        reasoning,
        reasoning_signature: None,
        tool_calls: delta
            .tool_calls
            .iter()
            .flatten()
            .map(map_tool_call)
            .collect(),
        finish_reason: None,
    }
}

fn map_role(role: &str) -> Role {
    match role {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}

fn map_tool_call(call: &ToolCallChunk) -> ToolCallDelta {
    let non_empty = |value: Option<&String>| value.filter(|v| !v.is_empty()).cloned();
    let function = call.function.as_ref();
    ToolCallDelta {
        index: call.index,
        id: non_empty(call.id.as_ref()),
        name: non_empty(function.and_then(|f| f.name.as_ref())),
        arguments: non_empty(function.and_then(|f| f.arguments.as_ref())),
    }
}
