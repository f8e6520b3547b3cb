//! 线协议与转码管道
//!
//! 每个协议提供一组函数：把 SSE 帧解码成原生事件、把原生事件归一化成统一
//! chunk、把统一 chunk 物化成原生事件，以及流正常结束或出错时的收尾。注册表按
//! [`Protocol`] 查找这组函数，管道本身不关心具体协议。

pub mod anthropic;
pub mod openai;
pub mod pipeline;
pub mod registry;
pub mod sse;

use crate::config::TranscoderConfig;
use crate::error::{Error, Result};
use crate::models::Protocol;
use crate::session::SessionState;
use crate::unified::UnifiedStreamChunk;
use anthropic::AnthropicStreamEvent;
use bytes::Bytes;
use openai::{OpenAIStreamEvent, DONE_MARKER};
use sse::{format_sse, SseFrame};

pub use pipeline::Transcoder;
pub use registry::Registry;

/// 带协议标签的原生事件
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    OpenAI(OpenAIStreamEvent),
    Anthropic(AnthropicStreamEvent),
}

impl NativeEvent {
    pub fn protocol(&self) -> Protocol {
        match self {
            NativeEvent::OpenAI(_) => Protocol::OpenAI,
            NativeEvent::Anthropic(_) => Protocol::Anthropic,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            NativeEvent::OpenAI(OpenAIStreamEvent::Chunk(_)) => "chunk",
            NativeEvent::OpenAI(OpenAIStreamEvent::Done) => "done",
            NativeEvent::OpenAI(OpenAIStreamEvent::Error(_)) => "error",
            NativeEvent::Anthropic(event) => event.event_name(),
        }
    }

    /// 编码成 SSE 帧：OpenAI 只有 data 行，Anthropic 带 event 行
    pub fn to_sse(&self) -> Result<Bytes> {
        let frame = match self {
            NativeEvent::OpenAI(OpenAIStreamEvent::Chunk(chunk)) => {
                format_sse(None, &serde_json::to_string(chunk)?)
            }
            NativeEvent::OpenAI(OpenAIStreamEvent::Done) => format_sse(None, DONE_MARKER),
            NativeEvent::OpenAI(OpenAIStreamEvent::Error(body)) => {
                format_sse(None, &serde_json::to_string(body)?)
            }
            NativeEvent::Anthropic(event) => {
                format_sse(Some(event.event_name()), &serde_json::to_string(event)?)
            }
        };
        Ok(Bytes::from(frame))
    }
}

pub type DecodeFn = fn(&SseFrame) -> Result<Option<NativeEvent>>;
pub type NormalizeFn = fn(&NativeEvent, &mut SessionState) -> Result<Option<UnifiedStreamChunk>>;
pub type MaterializeFn = fn(&UnifiedStreamChunk, &mut SessionState, &TranscoderConfig) -> Vec<NativeEvent>;
pub type FinishFn = fn(&mut SessionState, &TranscoderConfig) -> Vec<NativeEvent>;
pub type AbortFn = fn(&mut SessionState, &TranscoderConfig, &Error) -> Vec<NativeEvent>;

/// 一个协议的全部转换函数
#[derive(Clone, Copy)]
pub struct Transform {
    pub protocol: Protocol,
    pub decode: DecodeFn,
    pub normalize: NormalizeFn,
    pub materialize: MaterializeFn,
    pub finish: FinishFn,
    pub abort: AbortFn,
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl Transform {
    pub fn openai() -> Self {
        Self {
            protocol: Protocol::OpenAI,
            decode: openai::decode_frame,
            normalize: openai::normalizer::normalize,
            materialize: openai::materializer::materialize,
            finish: openai::materializer::finish,
            abort: openai::materializer::abort,
        }
    }

    pub fn anthropic() -> Self {
        Self {
            protocol: Protocol::Anthropic,
            decode: anthropic::decode_frame,
            normalize: anthropic::normalizer::normalize,
            materialize: anthropic::materializer::materialize,
            finish: anthropic::materializer::finish,
            abort: anthropic::materializer::abort,
        }
    }
}
