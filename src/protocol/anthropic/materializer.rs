//! 统一 chunk → Anthropic 事件
//!
//! 统一流没有 block 边界，这里根据内容类型的变化补出 block 的打开和关闭，
//! 并保证 `message_delta` 和 `message_stop` 各只发一次。
//!
//! 单个 chunk 内的输出顺序固定为：
//! message_start → 类型切换引起的关闭 → 打开 / 增量 → 结束时的关闭 →
//! message_delta → message_stop

use super::{
    AnthropicStreamEvent, BlockDelta, ContentBlockStart, DeltaUsage, MessageDeltaBody, MessageStart,
    StreamError,
};
use crate::config::TranscoderConfig;
use crate::error::Error;
use crate::protocol::NativeEvent;
use crate::session::{BlockKind, ContentBlock, Phase, SessionState, TerminalFlush};
use crate::telemetry;
use crate::unified::{ChoiceDelta, FinishReason, ToolCallDelta, UnifiedStreamChunk, UnifiedUsage};
use serde_json::json;
use tracing::{debug, warn};

/// 单个增量被分派到的内容类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    ToolCall,
    Text,
    Thinking,
}

/// 本增量要依次分派的类别
///
/// 带工具调用时只分派工具调用，同时出现的文本和推理被丢弃；
/// 否则先推理后文本，文本打开时的类型切换会关闭 thinking block
fn categories(delta: &ChoiceDelta) -> Vec<Category> {
    if delta.has_tool_calls() {
        return vec![Category::ToolCall];
    }
    let mut categories = Vec::new();
    if delta.has_reasoning() || delta.reasoning_signature.is_some() {
        categories.push(Category::Thinking);
    }
    if delta.has_text() {
        categories.push(Category::Text);
    }
    categories
}

pub fn materialize(
    chunk: &UnifiedStreamChunk,
    state: &mut SessionState,
    config: &TranscoderConfig,
) -> Vec<NativeEvent> {
    let mut out = Emitter::default();
    if state.is_finished() {
        debug!(id = %chunk.id, "anthropic egress already finished, dropping chunk");
        return out.events;
    }

    // 1. message_start
    if state.message_id().is_none() {
        let id = if chunk.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else {
            chunk.id.clone()
        };
        let input_tokens = chunk.usage.map(|u| u.prompt_tokens).unwrap_or_default();
        out.push(AnthropicStreamEvent::MessageStart {
            message: MessageStart::new(id.as_str(), chunk.model.as_str(), input_tokens),
        });
        state.start_message(id, chunk.model.clone());
        if config.ping_after_message_start {
            out.push(AnthropicStreamEvent::Ping);
        }
    }

    if let Some(delta) = chunk.primary() {
        if chunk.choices.len() > 1 {
            debug!(choices = chunk.choices.len(), "only the first choice is transcoded");
        }
        dispatch_content(delta, state, config, &mut out);

        // 4. 结束信号
        if let Some(reason) = &delta.finish_reason {
            state.latch_stop_reason(reason.clone());
            if state.advance(Phase::Finishing) {
                close_all(state, config, &mut out);
            }
        }
    }

    // 5. 用量
    if let Some(usage) = chunk.usage {
        state.latch_usage(usage);
    }

    // 6. flush
    let flush = state.flush_terminal();
    emit_terminal(flush, state, &mut out);
    out.events
}

/// 上游正常结束时收尾：关闭剩余 block，补齐终止元数据并发出 message_stop
pub fn finish(state: &mut SessionState, config: &TranscoderConfig) -> Vec<NativeEvent> {
    let mut out = Emitter::default();
    if state.is_finished() || state.message_id().is_none() {
        return out.events;
    }

    state.advance(Phase::Finishing);
    close_all(state, config, &mut out);
    if !state.stop_reason_emitted() {
        state.latch_stop_reason(FinishReason::Stop);
    }
    let flush = state.flush_remaining();
    emit_terminal(flush, state, &mut out);
    if !state.is_finished() {
        out.push(AnthropicStreamEvent::MessageStop);
        state.advance(Phase::Finished);
    }
    out.events
}

/// 上游出错时收尾：关闭剩余 block 后发出 error 事件
///
/// 不补 stop_reason，也不发 message_delta / message_stop，客户端据此区分被截断的回合
pub fn abort(state: &mut SessionState, config: &TranscoderConfig, error: &Error) -> Vec<NativeEvent> {
    let mut out = Emitter::default();
    if state.is_finished() {
        return out.events;
    }

    state.advance(Phase::Finishing);
    close_all(state, config, &mut out);
    out.push(AnthropicStreamEvent::Error {
        error: StreamError {
            error_type: error_type(error).to_string(),
            message: error.to_string(),
        },
    });
    state.advance(Phase::Finished);
    out.events
}

fn error_type(error: &Error) -> &'static str {
    match error {
        Error::InvalidRequest(_) => "invalid_request_error",
        _ => "api_error",
    }
}

fn dispatch_content(
    delta: &ChoiceDelta,
    state: &mut SessionState,
    config: &TranscoderConfig,
    out: &mut Emitter,
) {
    let categories = categories(delta);
    if categories.is_empty() {
        return;
    }

    if state.phase() >= Phase::Finishing {
        warn!(?categories, "content after finish signal, dropping");
        telemetry::event_dropped("anthropic", "content_after_finish");
        return;
    }
    if delta.has_tool_calls() && (delta.has_text() || delta.has_reasoning()) {
        warn!("delta mixes tool calls with other content, keeping only the tool calls");
        telemetry::event_dropped("anthropic", "mixed_delta");
    }

    for category in categories {
        transition(category, delta, state, config, out);
        dispatch(category, delta, state, out);
    }
}

/// 2. 类型切换：打开新类别前关闭目标协议要求显式结束的 block
fn transition(
    category: Category,
    delta: &ChoiceDelta,
    state: &mut SessionState,
    config: &TranscoderConfig,
    out: &mut Emitter,
) {
    match category {
        Category::ToolCall => {
            close_kind(BlockKind::Thinking, state, config, out);
            close_kind(BlockKind::Text, state, config, out);
        }
        Category::Text => {
            close_kind(BlockKind::Thinking, state, config, out);
            close_kind(BlockKind::ToolUse, state, config, out);
        }
        Category::Thinking if delta.has_reasoning() => {
            close_kind(BlockKind::Text, state, config, out);
            close_kind(BlockKind::ToolUse, state, config, out);
        }
        Category::Thinking => {}
    }
}

/// 3. 分派
fn dispatch(category: Category, delta: &ChoiceDelta, state: &mut SessionState, out: &mut Emitter) {
    match category {
        Category::ToolCall => {
            for call in &delta.tool_calls {
                dispatch_tool_call(call, state, out);
            }
        }
        Category::Text => {
            let index = ensure_open(ContentBlock::Text, state, out);
            out.push(AnthropicStreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::TextDelta { text: delta.text() },
            });
        }
        Category::Thinking => {
            if let Some(thinking) = delta.reasoning.as_ref().filter(|r| !r.is_empty()) {
                let index = ensure_open(ContentBlock::Thinking, state, out);
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: thinking.clone(),
                    },
                });
            }
            if let Some(signature) = &delta.reasoning_signature {
                match state.open_block_of_kind(BlockKind::Thinking) {
                    Some(index) => {
                        out.push(AnthropicStreamEvent::ContentBlockDelta {
                            index,
                            delta: BlockDelta::SignatureDelta {
                                signature: signature.clone(),
                            },
                        });
                        state.mark_signed(index);
                    }
                    None => {
                        warn!("signature without an open thinking block, dropping");
                        telemetry::event_dropped("anthropic", "orphan_signature");
                    }
                }
            }
        }
    }
}

fn dispatch_tool_call(call: &ToolCallDelta, state: &mut SessionState, out: &mut Emitter) {
    let opening = match (&call.id, &call.name) {
        (Some(id), Some(name)) if state.tool_block_by_id(id).is_none() => Some((id.clone(), name.clone())),
        (None, Some(name)) if state.tool_block_by_source_index(call.index).is_none() => {
            Some((format!("toolu_{}", uuid::Uuid::new_v4().simple()), name.clone()))
        }
        _ => None,
    };

    let index = match opening {
        Some((id, name)) => {
            let index = state.open_block(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
            });
            out.push(AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlockStart::ToolUse {
                    id,
                    name,
                    input: json!({}),
                },
            });
            index
        }
        None => match state.route_tool_fragment(call.id.as_deref(), call.index) {
            Some(index) => index,
            None => {
                warn!(index = call.index, id = ?call.id, "tool call fragment has no open block, dropping");
                telemetry::event_dropped("anthropic", "unroutable_tool_fragment");
                return;
            }
        },
    };
    state.bind_source_tool_index(call.index, index);

    if let Some(arguments) = call.arguments.as_ref().filter(|a| !a.is_empty()) {
        out.push(AnthropicStreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: arguments.clone(),
            },
        });
    }
}

/// 返回该类型已打开的 block，没有则打开一个新的
fn ensure_open(block: ContentBlock, state: &mut SessionState, out: &mut Emitter) -> u32 {
    if let Some(index) = state.open_block_of_kind(block.kind()) {
        return index;
    }
    let content_block = match &block {
        ContentBlock::Text => ContentBlockStart::Text {
            text: String::new(),
        },
        ContentBlock::Thinking => ContentBlockStart::Thinking {
            thinking: String::new(),
            signature: None,
        },
        ContentBlock::ToolUse { id, name } => ContentBlockStart::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: json!({}),
        },
    };
    let index = state.open_block(block);
    out.push(AnthropicStreamEvent::ContentBlockStart {
        index,
        content_block,
    });
    index
}

fn close_kind(kind: BlockKind, state: &mut SessionState, config: &TranscoderConfig, out: &mut Emitter) {
    let indices: Vec<u32> = state
        .open_indices()
        .into_iter()
        .filter(|index| state.block(*index).map(|b| b.block.kind()) == Some(kind))
        .collect();
    for index in indices {
        close(index, state, config, out);
    }
}

fn close_all(state: &mut SessionState, config: &TranscoderConfig, out: &mut Emitter) {
    for index in state.open_indices() {
        close(index, state, config, out);
    }
}

fn close(index: u32, state: &mut SessionState, config: &TranscoderConfig, out: &mut Emitter) {
    let Some(open) = state.close_block(index) else {
        return;
    };
    if open.block == ContentBlock::Thinking && !open.signed && config.synthesize_thinking_signature {
        out.push(AnthropicStreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::SignatureDelta {
                signature: format!("sig_{}", uuid::Uuid::new_v4().simple()),
            },
        });
    }
    out.push(AnthropicStreamEvent::ContentBlockStop { index });
}

fn emit_terminal(flush: TerminalFlush, state: &mut SessionState, out: &mut Emitter) {
    if let TerminalFlush::Metadata { stop_reason, usage } = flush {
        out.push(AnthropicStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: stop_reason.as_ref().map(map_finish_reason),
                stop_sequence: None,
            },
            usage: usage.map(delta_usage),
        });
    }
    if state.terminal_complete() && !state.is_finished() {
        out.push(AnthropicStreamEvent::MessageStop);
        state.advance(Phase::Finished);
    }
}

fn map_finish_reason(reason: &FinishReason) -> String {
    let mapped = match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Other(other) => match other.as_str() {
            known @ ("end_turn" | "max_tokens" | "stop_sequence" | "tool_use" | "pause_turn"
            | "refusal") => known,
            _ => "end_turn",
        },
    };
    mapped.to_string()
}

fn delta_usage(usage: UnifiedUsage) -> DeltaUsage {
    DeltaUsage {
        input_tokens: Some(usage.prompt_tokens),
        output_tokens: usage.completion_tokens,
        ..Default::default()
    }
}

#[derive(Default)]
struct Emitter {
    events: Vec<NativeEvent>,
}

impl Emitter {
    fn push(&mut self, event: AnthropicStreamEvent) {
        self.events.push(NativeEvent::Anthropic(event));
    }
}
