//! Anthropic 事件 → 统一 chunk
//!
//! block 流的索引只在来源侧有意义：normalizer 记录每个 block 的类型，
//! 工具块额外分配一个调用序号，作为统一模型里 `ToolCallDelta::index`。

use super::{AnthropicStreamEvent, BlockDelta, ContentBlockStart, DeltaUsage, MessageDeltaBody};
use crate::error::{Error, Result};
use crate::protocol::NativeEvent;
use crate::session::{BlockKind, ContentBlock, Phase, SessionState};
use crate::unified::{
    ChoiceDelta, ContentPart, FinishReason, Role, ToolCallDelta, UnifiedStreamChunk, UnifiedUsage,
};
use tracing::{debug, error};

pub fn normalize(event: &NativeEvent, state: &mut SessionState) -> Result<Option<UnifiedStreamChunk>> {
    let NativeEvent::Anthropic(event) = event else {
        return Err(Error::MalformedNativeEvent(format!(
            "expected anthropic event, got {}",
            event.protocol()
        )));
    };

    if state.is_finished() && !matches!(event, AnthropicStreamEvent::Ping) {
        return Err(Error::ProtocolInvariantViolation(format!(
            "{} after message_stop",
            event.event_name()
        )));
    }

    match event {
        AnthropicStreamEvent::MessageStart { message } => {
            let input_tokens = message.usage.prompt_tokens();
            state.record_input_tokens(input_tokens);
            state.start_message(message.id.clone(), message.model.clone());
            let mut start = chunk(
                state,
                ChoiceDelta {
                    role: Some(Role::Assistant),
                    ..Default::default()
                },
            );
            start.usage = Some(UnifiedUsage::new(input_tokens, 0));
            Ok(Some(start))
        }
        AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block,
        } => block_start(*index, content_block, state),
        AnthropicStreamEvent::ContentBlockDelta { index, delta } => block_delta(*index, delta, state),
        AnthropicStreamEvent::ContentBlockStop { index } => {
            state.retire_source_block(*index).ok_or_else(|| {
                Error::ProtocolInvariantViolation(format!("content_block_stop for unknown block {}", index))
            })?;
            Ok(None)
        }
        AnthropicStreamEvent::MessageDelta { delta, usage } => Ok(message_delta(delta, usage.as_ref(), state)),
        AnthropicStreamEvent::MessageStop => {
            state.advance(Phase::Finished);
            Ok(None)
        }
        AnthropicStreamEvent::Ping => Ok(None),
        AnthropicStreamEvent::Error { error: stream_error } => {
            error!(
                error_type = %stream_error.error_type,
                message = %stream_error.message,
                "anthropic stream reported an error"
            );
            Ok(None)
        }
    }
}

fn block_start(
    index: u32,
    content_block: &ContentBlockStart,
    state: &mut SessionState,
) -> Result<Option<UnifiedStreamChunk>> {
    if state.source_block(index).is_some() {
        return Err(Error::ProtocolInvariantViolation(format!(
            "content_block_start for already open block {}",
            index
        )));
    }

    let recorded = match content_block {
        ContentBlockStart::Text { .. } => ContentBlock::Text,
        ContentBlockStart::Thinking { .. } | ContentBlockStart::RedactedThinking { .. } => {
            ContentBlock::Thinking
        }
        ContentBlockStart::ToolUse { id, name, .. } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
        },
    };
    let block = state.record_source_block(index, recorded);

    let delta = match content_block {
        ContentBlockStart::Text { text } if !text.is_empty() => ChoiceDelta {
            content: vec![ContentPart::text(text.as_str())],
            ..Default::default()
        },
        ContentBlockStart::Thinking { thinking, signature }
            if !thinking.is_empty() || signature.is_some() =>
        {
            ChoiceDelta {
                reasoning: Some(thinking.clone()).filter(|t| !t.is_empty()),
                reasoning_signature: signature.clone(),
                ..Default::default()
            }
        }
        ContentBlockStart::ToolUse { id, name, .. } => ChoiceDelta {
            tool_calls: vec![ToolCallDelta::start(
                block.tool_ordinal.unwrap_or_default(),
                id.as_str(),
                name.as_str(),
            )],
            ..Default::default()
        },
        ContentBlockStart::RedactedThinking { .. } => {
            debug!(index, "redacted thinking block has no transferable content");
            return Ok(None);
        }
        _ => return Ok(None),
    };
    Ok(Some(chunk(state, delta)))
}

fn block_delta(
    index: u32,
    delta: &BlockDelta,
    state: &mut SessionState,
) -> Result<Option<UnifiedStreamChunk>> {
    let Some(block) = state.source_block(index) else {
        return Err(Error::ProtocolInvariantViolation(format!(
            "content_block_delta for unknown block {}",
            index
        )));
    };

    let unified = match (block.kind(), delta) {
        (BlockKind::Text, BlockDelta::TextDelta { text }) => ChoiceDelta {
            content: vec![ContentPart::text(text.as_str())],
            ..Default::default()
        },
        (BlockKind::Thinking, BlockDelta::ThinkingDelta { thinking }) => ChoiceDelta {
            reasoning: Some(thinking.clone()),
            ..Default::default()
        },
        (BlockKind::Thinking, BlockDelta::SignatureDelta { signature }) => ChoiceDelta {
            reasoning_signature: Some(signature.clone()),
            ..Default::default()
        },
        (BlockKind::ToolUse, BlockDelta::InputJsonDelta { partial_json }) => {
            if partial_json.is_empty() {
                return Ok(None);
            }
            let mut call =
                ToolCallDelta::arguments(block.tool_ordinal.unwrap_or_default(), partial_json.as_str());
            call.id = block.tool_id().map(str::to_string);
            ChoiceDelta {
                tool_calls: vec![call],
                ..Default::default()
            }
        }
        (kind, delta) => {
            return Err(Error::ProtocolInvariantViolation(format!(
                "delta {:?} does not match {:?} block {}",
                delta, kind, index
            )))
        }
    };
    Ok(Some(chunk(state, unified)))
}

fn message_delta(
    delta: &MessageDeltaBody,
    usage: Option<&DeltaUsage>,
    state: &mut SessionState,
) -> Option<UnifiedStreamChunk> {
    let finish_reason = delta.stop_reason.as_deref().map(map_stop_reason);
    if finish_reason.is_some() {
        state.advance(Phase::Finishing);
    }

    let usage = usage.map(|usage| {
        let prompt = usage
            .prompt_tokens()
            .or(state.input_tokens())
            .unwrap_or_default();
        UnifiedUsage::new(prompt, usage.output_tokens)
    });

    if finish_reason.is_none() && usage.is_none() {
        return None;
    }

    let mut unified = chunk(
        state,
        ChoiceDelta {
            finish_reason,
            ..Default::default()
        },
    );
    unified.usage = usage;
    Some(unified)
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn chunk(state: &SessionState, delta: ChoiceDelta) -> UnifiedStreamChunk {
    UnifiedStreamChunk::new(
        state.message_id().unwrap_or_default(),
        state.model().unwrap_or_default(),
        state.created(),
    )
    .with_delta(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::anthropic::{MessageStart, StreamError};
    use serde_json::json;

    fn event(event: AnthropicStreamEvent) -> NativeEvent {
        NativeEvent::Anthropic(event)
    }

    fn started() -> SessionState {
        let mut state = SessionState::new();
        let start = event(AnthropicStreamEvent::MessageStart {
            message: MessageStart::new("msg_1", "claude-sonnet-4", 12),
        });
        let chunk = normalize(&start, &mut state).unwrap().unwrap();
        assert_eq!(chunk.primary().unwrap().role, Some(Role::Assistant));
        assert_eq!(chunk.usage, Some(UnifiedUsage::new(12, 0)));
        state
    }

    #[test]
    fn translates_deltas_by_recorded_kind() {
        let mut state = started();
        normalize(
            &event(AnthropicStreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlockStart::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            }),
            &mut state,
        )
        .unwrap();

        let thinking = normalize(
            &event(AnthropicStreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::ThinkingDelta {
                    thinking: "hmm".into(),
                },
            }),
            &mut state,
        )
        .unwrap()
        .unwrap();
        assert_eq!(thinking.primary().unwrap().reasoning.as_deref(), Some("hmm"));

        let signature = normalize(
            &event(AnthropicStreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::SignatureDelta {
                    signature: "sig".into(),
                },
            }),
            &mut state,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            signature.primary().unwrap().reasoning_signature.as_deref(),
            Some("sig")
        );

        let mismatch = normalize(
            &event(AnthropicStreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::TextDelta { text: "x".into() },
            }),
            &mut state,
        );
        assert!(matches!(mismatch, Err(Error::ProtocolInvariantViolation(_))));
    }

    #[test]
    fn tool_blocks_get_ordinals() {
        let mut state = started();
        normalize(
            &event(AnthropicStreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlockStart::Text { text: String::new() },
            }),
            &mut state,
        )
        .unwrap();
        let start = normalize(
            &event(AnthropicStreamEvent::ContentBlockStart {
                index: 1,
                content_block: ContentBlockStart::ToolUse {
                    id: "toolu_1".into(),
                    name: "lookup".into(),
                    input: json!({}),
                },
            }),
            &mut state,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            start.primary().unwrap().tool_calls,
            vec![ToolCallDelta::start(0, "toolu_1", "lookup")]
        );

        let args = normalize(
            &event(AnthropicStreamEvent::ContentBlockDelta {
                index: 1,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: "{}".into(),
                },
            }),
            &mut state,
        )
        .unwrap()
        .unwrap();
        let call = &args.primary().unwrap().tool_calls[0];
        assert_eq!(call.index, 0);
        assert_eq!(call.id.as_deref(), Some("toolu_1"));
        assert_eq!(call.name, None);
        assert_eq!(call.arguments.as_deref(), Some("{}"));
    }

    #[test]
    fn unknown_block_is_violation() {
        let mut state = started();
        let stop = normalize(
            &event(AnthropicStreamEvent::ContentBlockStop { index: 4 }),
            &mut state,
        );
        assert!(matches!(stop, Err(Error::ProtocolInvariantViolation(_))));
    }

    #[test]
    fn message_delta_combines_usage_from_start() {
        let mut state = started();
        let chunk = normalize(
            &event(AnthropicStreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some("max_tokens".into()),
                    stop_sequence: None,
                },
                usage: Some(DeltaUsage {
                    output_tokens: 30,
                    ..Default::default()
                }),
            }),
            &mut state,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.finish_reason(), Some(&FinishReason::Length));
        assert_eq!(chunk.usage, Some(UnifiedUsage::new(12, 30)));
        assert_eq!(state.phase(), Phase::Finishing);

        assert!(normalize(&event(AnthropicStreamEvent::MessageStop), &mut state)
            .unwrap()
            .is_none());
        assert!(state.is_finished());
    }

    #[test]
    fn ping_and_error_produce_nothing() {
        let mut state = started();
        assert!(normalize(&event(AnthropicStreamEvent::Ping), &mut state)
            .unwrap()
            .is_none());
        let failure = event(AnthropicStreamEvent::Error {
            error: StreamError {
                error_type: "overloaded_error".into(),
                message: "Overloaded".into(),
            },
        });
        assert!(normalize(&failure, &mut state).unwrap().is_none());
    }
}
