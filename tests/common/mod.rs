#![allow(dead_code)]

use ai_gateway_transcoder::config::TranscoderConfig;
use ai_gateway_transcoder::protocol::anthropic::{self, AnthropicStreamEvent};
use ai_gateway_transcoder::protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionChunk, OpenAIStreamEvent, ToolCallChunk,
    Usage, CHUNK_OBJECT,
};
use ai_gateway_transcoder::session::SessionState;
use ai_gateway_transcoder::unified::UnifiedStreamChunk;
use ai_gateway_transcoder::NativeEvent;

/// 把统一 chunk 序列物化成 Anthropic 事件，包括流结束时的收尾
pub fn materialize_anthropic(chunks: &[UnifiedStreamChunk]) -> Vec<AnthropicStreamEvent> {
    materialize_anthropic_with(chunks, &TranscoderConfig::default())
}

pub fn materialize_anthropic_with(
    chunks: &[UnifiedStreamChunk],
    config: &TranscoderConfig,
) -> Vec<AnthropicStreamEvent> {
    let mut state = SessionState::new();
    let mut events = Vec::new();
    for chunk in chunks {
        events.extend(anthropic::materializer::materialize(chunk, &mut state, config));
    }
    events.extend(anthropic::materializer::finish(&mut state, config));
    events.into_iter().map(into_anthropic).collect()
}

pub fn into_anthropic(event: NativeEvent) -> AnthropicStreamEvent {
    match event {
        NativeEvent::Anthropic(event) => event,
        other => panic!("expected anthropic event, got {:?}", other),
    }
}

pub fn into_openai(event: NativeEvent) -> OpenAIStreamEvent {
    match event {
        NativeEvent::OpenAI(event) => event,
        other => panic!("expected openai event, got {:?}", other),
    }
}

pub fn names(events: &[AnthropicStreamEvent]) -> Vec<&'static str> {
    events.iter().map(AnthropicStreamEvent::event_name).collect()
}

pub fn openai_chunk(delta: ChunkDelta, finish_reason: Option<&str>) -> NativeEvent {
    NativeEvent::OpenAI(OpenAIStreamEvent::Chunk(ChatCompletionChunk {
        id: "chatcmpl-42".into(),
        object: CHUNK_OBJECT.into(),
        created: 1_700_000_000,
        model: "gpt-4o".into(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_string),
        }],
        usage: None,
        system_fingerprint: None,
    }))
}

pub fn openai_usage(prompt_tokens: u64, completion_tokens: u64) -> NativeEvent {
    NativeEvent::OpenAI(OpenAIStreamEvent::Chunk(ChatCompletionChunk {
        id: "chatcmpl-42".into(),
        object: CHUNK_OBJECT.into(),
        created: 1_700_000_000,
        model: "gpt-4o".into(),
        choices: Vec::new(),
        usage: Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: Some(prompt_tokens.saturating_add(completion_tokens)),
        }),
        system_fingerprint: None,
    }))
}

pub fn openai_text(text: &str) -> NativeEvent {
    openai_chunk(
        ChunkDelta {
            content: Some(text.into()),
            ..Default::default()
        },
        None,
    )
}

pub fn openai_role() -> NativeEvent {
    openai_chunk(
        ChunkDelta {
            role: Some("assistant".into()),
            content: Some(String::new()),
            ..Default::default()
        },
        None,
    )
}

pub fn openai_finish(reason: &str) -> NativeEvent {
    openai_chunk(ChunkDelta::default(), Some(reason))
}

pub fn openai_tool(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> NativeEvent {
    openai_chunk(
        ChunkDelta {
            tool_calls: Some(vec![ToolCallChunk {
                index,
                id: id.map(str::to_string),
                call_type: id.map(|_| "function".to_string()),
                function: Some(FunctionChunk {
                    name: name.map(str::to_string),
                    arguments: Some(arguments.to_string()),
                }),
            }]),
            ..Default::default()
        },
        None,
    )
}

pub fn openai_done() -> NativeEvent {
    NativeEvent::OpenAI(OpenAIStreamEvent::Done)
}

/// 检查 block 配对：每个 start 恰好一个 stop，且所有 delta 都落在打开期间
pub fn assert_block_pairing(events: &[AnthropicStreamEvent]) {
    use std::collections::HashSet;

    let mut open = HashSet::new();
    let mut closed = HashSet::new();
    for event in events {
        match event {
            AnthropicStreamEvent::ContentBlockStart { index, .. } => {
                assert!(!closed.contains(index), "block {} reopened", index);
                assert!(open.insert(*index), "block {} started twice", index);
            }
            AnthropicStreamEvent::ContentBlockDelta { index, .. } => {
                assert!(open.contains(index), "delta for block {} that is not open", index);
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                assert!(open.remove(index), "stop for block {} that is not open", index);
                closed.insert(*index);
            }
            AnthropicStreamEvent::MessageDelta { .. } | AnthropicStreamEvent::MessageStop => {
                assert!(open.is_empty(), "{} while blocks {:?} are open", event.event_name(), open);
            }
            _ => {}
        }
    }
    assert!(open.is_empty(), "blocks {:?} never closed", open);
}

/// 检查终止事件：最多一个 message_delta、一个 message_stop，stop 在 delta 之后且是最后一个事件
pub fn assert_single_terminal(events: &[AnthropicStreamEvent]) {
    let deltas: Vec<usize> = positions(events, "message_delta");
    let stops: Vec<usize> = positions(events, "message_stop");
    assert!(deltas.len() <= 1, "{} message_delta events", deltas.len());
    assert!(stops.len() <= 1, "{} message_stop events", stops.len());
    if let (Some(delta), Some(stop)) = (deltas.first(), stops.first()) {
        assert!(delta < stop, "message_stop precedes message_delta");
    }
    if let Some(stop) = stops.first() {
        assert_eq!(*stop, events.len() - 1, "events after message_stop");
    }
}

fn positions(events: &[AnthropicStreamEvent], name: &str) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.event_name() == name)
        .map(|(i, _)| i)
        .collect()
}
