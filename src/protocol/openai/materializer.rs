//! 统一 chunk → OpenAI chunk
//!
//! 目标侧只用 session 的 block 账本记录工具调用，所以 block 索引就是
//! 输出中 `tool_calls[].index` 的调用序号。

use super::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ErrorBody, FunctionChunk, OpenAIStreamEvent,
    ToolCallChunk, Usage, CHUNK_OBJECT,
};
use crate::config::TranscoderConfig;
use crate::error::Error;
use crate::protocol::NativeEvent;
use crate::session::{ContentBlock, Phase, SessionState, TerminalFlush};
use crate::telemetry;
use crate::unified::{ChoiceDelta, ContentPart, FinishReason, ToolCallDelta, UnifiedStreamChunk, UnifiedUsage};
use tracing::{debug, warn};

pub fn materialize(
    chunk: &UnifiedStreamChunk,
    state: &mut SessionState,
    _config: &TranscoderConfig,
) -> Vec<NativeEvent> {
    if state.is_finished() {
        debug!(id = %chunk.id, "openai egress already finished, dropping chunk");
        return Vec::new();
    }

    let first = state.message_id().is_none();
    if first {
        let id = if chunk.id.is_empty() {
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
        } else {
            chunk.id.clone()
        };
        if chunk.created != 0 {
            state.set_created(chunk.created);
        }
        state.start_message(id, chunk.model.clone());
    }

    let mut delta = ChunkDelta {
        role: first.then(|| "assistant".to_string()),
        ..Default::default()
    };

    if let Some(source) = chunk.primary() {
        fill_delta(&mut delta, source, state);
        if let Some(reason) = &source.finish_reason {
            state.latch_stop_reason(reason.clone());
            state.advance(Phase::Finishing);
        }
    }
    if let Some(usage) = chunk.usage {
        state.latch_usage(usage);
    }

    // 结束信号之前的用量（例如 message_start 带来的输入 token）只暂存
    let flush = if state.phase() >= Phase::Finishing {
        state.flush_remaining()
    } else {
        TerminalFlush::Nothing
    };
    let (finish_reason, usage) = match flush {
        TerminalFlush::Nothing => (None, None),
        TerminalFlush::Metadata { stop_reason, usage } => (stop_reason, usage),
    };

    let mut events = Vec::new();
    if !delta.is_empty() || finish_reason.is_some() {
        events.push(choice_event(
            state,
            delta,
            finish_reason.as_ref().map(map_finish_reason),
        ));
    }
    if let Some(usage) = usage {
        events.push(usage_event(state, usage));
    }
    events
}

/// 流结束：补出缺失的 finish_reason 和用量，然后发出唯一一次 `[DONE]`
pub fn finish(state: &mut SessionState, _config: &TranscoderConfig) -> Vec<NativeEvent> {
    if state.is_finished() {
        return Vec::new();
    }

    let mut events = Vec::new();
    if state.message_id().is_some() {
        if !state.stop_reason_emitted() {
            state.latch_stop_reason(FinishReason::Stop);
        }
        if let TerminalFlush::Metadata { stop_reason, usage } = state.flush_remaining() {
            if let Some(reason) = stop_reason {
                events.push(choice_event(
                    state,
                    ChunkDelta::default(),
                    Some(map_finish_reason(&reason)),
                ));
            }
            if let Some(usage) = usage {
                events.push(usage_event(state, usage));
            }
        }
    }

    events.push(NativeEvent::OpenAI(OpenAIStreamEvent::Done));
    state.advance(Phase::Finished);
    events
}

/// 上游出错：发出一个 error 帧后结束，不补 finish_reason 也不发 `[DONE]`
pub fn abort(state: &mut SessionState, _config: &TranscoderConfig, error: &Error) -> Vec<NativeEvent> {
    if state.is_finished() {
        return Vec::new();
    }
    state.advance(Phase::Finished);
    let error_type = match error {
        Error::InvalidRequest(_) => "invalid_request_error",
        _ => "server_error",
    };
    vec![NativeEvent::OpenAI(OpenAIStreamEvent::Error(ErrorBody::new(
        error_type,
        error.to_string(),
    )))]
}

fn fill_delta(delta: &mut ChunkDelta, source: &ChoiceDelta, state: &mut SessionState) {
    let mut text = String::new();
    let mut refusal = String::new();
    for part in &source.content {
        match part {
            ContentPart::Text { text: t } => text.push_str(t),
            ContentPart::Refusal { refusal: r } => refusal.push_str(r),
        }
    }
    if !text.is_empty() {
        delta.content = Some(text);
    }
    if !refusal.is_empty() {
        delta.refusal = Some(refusal);
    }
    if source.has_reasoning() {
        delta.reasoning_content = source.reasoning.clone();
    }

    let calls: Vec<ToolCallChunk> = source
        .tool_calls
        .iter()
        .filter_map(|call| map_tool_call(call, state))
        .collect();
    if !calls.is_empty() {
        delta.tool_calls = Some(calls);
    }
}

fn map_tool_call(call: &ToolCallDelta, state: &mut SessionState) -> Option<ToolCallChunk> {
    let opening = match (&call.id, &call.name) {
        (Some(id), Some(name)) if state.tool_block_by_id(id).is_none() => Some((id.clone(), name.clone())),
        (None, Some(name)) if state.tool_block_by_source_index(call.index).is_none() => {
            Some((format!("call_{}", uuid::Uuid::new_v4().simple()), name.clone()))
        }
        _ => None,
    };

    if let Some((id, name)) = opening {
        let ordinal = state.open_block(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
        });
        state.bind_source_tool_index(call.index, ordinal);
        return Some(ToolCallChunk {
            index: ordinal,
            id: Some(id),
            call_type: Some("function".to_string()),
            function: Some(FunctionChunk {
                name: Some(name),
                arguments: Some(call.arguments.clone().unwrap_or_default()),
            }),
        });
    }

    let Some(ordinal) = state.route_tool_fragment(call.id.as_deref(), call.index) else {
        warn!(index = call.index, id = ?call.id, "tool call fragment has no open call, dropping");
        telemetry::event_dropped("openai", "unroutable_tool_fragment");
        return None;
    };
    state.bind_source_tool_index(call.index, ordinal);
    if !call.has_arguments() {
        return None;
    }
    Some(ToolCallChunk {
        index: ordinal,
        id: None,
        call_type: None,
        function: Some(FunctionChunk {
            name: None,
            arguments: call.arguments.clone(),
        }),
    })
}

fn map_finish_reason(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Other(other) => match other.as_str() {
            "end_turn" | "stop_sequence" => "stop".to_string(),
            "max_tokens" => "length".to_string(),
            "tool_use" => "tool_calls".to_string(),
            "refusal" => "content_filter".to_string(),
            _ => "stop".to_string(),
        },
        known => known.as_str().to_string(),
    }
}

fn base_chunk(state: &SessionState) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: state.message_id().unwrap_or_default().to_string(),
        object: CHUNK_OBJECT.to_string(),
        created: state.created(),
        model: state.model().unwrap_or_default().to_string(),
        choices: Vec::new(),
        usage: None,
        system_fingerprint: None,
    }
}

fn choice_event(state: &SessionState, delta: ChunkDelta, finish_reason: Option<String>) -> NativeEvent {
    let mut chunk = base_chunk(state);
    chunk.choices.push(ChunkChoice {
        index: 0,
        delta,
        finish_reason,
    });
    NativeEvent::OpenAI(OpenAIStreamEvent::Chunk(chunk))
}

fn usage_event(state: &SessionState, usage: UnifiedUsage) -> NativeEvent {
    let mut chunk = base_chunk(state);
    chunk.usage = Some(Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: Some(usage.total_tokens),
    });
    NativeEvent::OpenAI(OpenAIStreamEvent::Chunk(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unified(delta: ChoiceDelta) -> UnifiedStreamChunk {
        UnifiedStreamChunk::new("msg_1", "claude-sonnet-4", 1_700_000_000).with_delta(delta)
    }

    fn chunks(events: &[NativeEvent]) -> Vec<&ChatCompletionChunk> {
        events
            .iter()
            .filter_map(|e| match e {
                NativeEvent::OpenAI(OpenAIStreamEvent::Chunk(c)) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn role_only_on_first_chunk() {
        let config = TranscoderConfig::default();
        let mut state = SessionState::new();
        let first = materialize(
            &unified(ChoiceDelta {
                content: vec![ContentPart::text("Hel")],
                ..Default::default()
            }),
            &mut state,
            &config,
        );
        let second = materialize(
            &unified(ChoiceDelta {
                content: vec![ContentPart::text("lo")],
                ..Default::default()
            }),
            &mut state,
            &config,
        );
        let first = chunks(&first);
        let second = chunks(&second);
        assert_eq!(first[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(first[0].choices[0].delta.content.as_deref(), Some("Hel"));
        assert_eq!(second[0].choices[0].delta.role, None);
        assert_eq!(second[0].id, "msg_1");
    }

    #[test]
    fn tool_calls_get_stable_ordinals() {
        let config = TranscoderConfig::default();
        let mut state = SessionState::new();
        let open = materialize(
            &unified(ChoiceDelta {
                tool_calls: vec![ToolCallDelta::start(3, "toolu_1", "lookup")],
                ..Default::default()
            }),
            &mut state,
            &config,
        );
        let args = materialize(
            &unified(ChoiceDelta {
                tool_calls: vec![ToolCallDelta::arguments(3, "{\"q\":1}")],
                ..Default::default()
            }),
            &mut state,
            &config,
        );

        let open = &chunks(&open)[0].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(open.index, 0);
        assert_eq!(open.id.as_deref(), Some("toolu_1"));
        assert_eq!(open.call_type.as_deref(), Some("function"));

        let args = &chunks(&args)[0].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(args.index, 0);
        assert_eq!(args.id, None);
        assert_eq!(
            args.function.as_ref().and_then(|f| f.arguments.as_deref()),
            Some("{\"q\":1}")
        );
    }

    #[test]
    fn finish_usage_and_done_once() {
        let config = TranscoderConfig::default();
        let mut state = SessionState::new();
        let events = materialize(
            &unified(ChoiceDelta {
                finish_reason: Some(FinishReason::Other("tool_use".into())),
                ..Default::default()
            })
            .with_usage(UnifiedUsage::new(5, 3)),
            &mut state,
            &config,
        );
        let out = chunks(&events);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert!(out[1].choices.is_empty());
        assert_eq!(out[1].usage.and_then(|u| u.total_tokens), Some(8));

        let tail = finish(&mut state, &config);
        assert_eq!(tail, vec![NativeEvent::OpenAI(OpenAIStreamEvent::Done)]);
        assert!(finish(&mut state, &config).is_empty());
    }

    #[test]
    fn early_usage_waits_for_finish_reason() {
        let config = TranscoderConfig::default();
        let mut state = SessionState::new();
        let events = materialize(
            &unified(ChoiceDelta {
                content: vec![ContentPart::text("hi")],
                ..Default::default()
            })
            .with_usage(UnifiedUsage::new(42, 0)),
            &mut state,
            &config,
        );
        assert_eq!(events.len(), 1);
        assert!(chunks(&events)[0].usage.is_none());

        let events = materialize(
            &unified(ChoiceDelta {
                finish_reason: Some(FinishReason::Stop),
                ..Default::default()
            })
            .with_usage(UnifiedUsage::new(42, 7)),
            &mut state,
            &config,
        );
        let out = chunks(&events);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(out[1].usage.map(|u| (u.prompt_tokens, u.completion_tokens)), Some((42, 7)));
    }

    #[test]
    fn abort_reports_error_without_stop_or_done() {
        let config = TranscoderConfig::default();
        let mut state = SessionState::new();
        materialize(
            &unified(ChoiceDelta {
                content: vec![ContentPart::text("hi")],
                ..Default::default()
            }),
            &mut state,
            &config,
        );
        let tail = abort(&mut state, &config, &Error::Upstream("connection reset".into()));
        assert_eq!(tail.len(), 1);
        let NativeEvent::OpenAI(OpenAIStreamEvent::Error(body)) = &tail[0] else {
            panic!("expected error frame");
        };
        assert_eq!(body.error.error_type, "server_error");
        assert!(state.is_finished());
        assert!(finish(&mut state, &config).is_empty());
    }

    #[test]
    fn finish_supplies_missing_stop() {
        let config = TranscoderConfig::default();
        let mut state = SessionState::new();
        materialize(
            &unified(ChoiceDelta {
                content: vec![ContentPart::text("hi")],
                ..Default::default()
            }),
            &mut state,
            &config,
        );
        let tail = finish(&mut state, &config);
        assert_eq!(tail.len(), 2);
        assert_eq!(chunks(&tail)[0].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(tail[1], NativeEvent::OpenAI(OpenAIStreamEvent::Done));
    }
}
