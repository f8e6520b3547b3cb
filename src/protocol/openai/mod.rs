//! OpenAI chat/completions 流式协议（增量 delta 流）
//!
//! ```text
//! data: {"id":"chatcmpl-123","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}
//! data: {"id":"chatcmpl-123","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}
//! data: {"id":"chatcmpl-123","object":"chat.completion.chunk","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}
//! data: {"id":"chatcmpl-123","object":"chat.completion.chunk","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}
//! data: [DONE]
//! ```

use super::sse::SseFrame;
use super::NativeEvent;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub mod materializer;
pub mod normalizer;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const DONE_MARKER: &str = "[DONE]";

fn chunk_object() -> String {
    CHUNK_OBJECT.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    /// 没有结束时序列化为 null
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// DeepSeek 等兼容实现的推理内容字段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// OpenRouter 风格的推理字段，只读入不写出
    #[serde(default, skip_serializing)]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallChunk>>,
}

impl ChunkDelta {
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.is_none()
            && self.reasoning_content.is_none()
            && self.refusal.is_none()
            && self.tool_calls.as_ref().map_or(true, Vec::is_empty)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    /// 部分兼容实现不返回总数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// 流中途出错时的 `data: {"error": {...}}` 帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
                code: None,
            },
        }
    }
}

/// OpenAI 流中的一个事件
#[derive(Debug, Clone, PartialEq)]
pub enum OpenAIStreamEvent {
    Chunk(ChatCompletionChunk),
    /// 上游出错，之后不会再有 `[DONE]`
    Error(ErrorBody),
    /// `data: [DONE]` 终止标记
    Done,
}

/// 把一个 SSE 帧解码成 OpenAI 事件，没有 data 的帧返回 None
pub fn decode_frame(frame: &SseFrame) -> Result<Option<NativeEvent>> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == DONE_MARKER {
        return Ok(Some(NativeEvent::OpenAI(OpenAIStreamEvent::Done)));
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| Error::MalformedNativeEvent(format!("openai chunk: {}", e)))?;
    let event = if value.get("error").is_some() {
        let body: ErrorBody = serde_json::from_value(value)
            .map_err(|e| Error::MalformedNativeEvent(format!("openai error: {}", e)))?;
        OpenAIStreamEvent::Error(body)
    } else {
        let chunk: ChatCompletionChunk = serde_json::from_value(value)
            .map_err(|e| Error::MalformedNativeEvent(format!("openai chunk: {}", e)))?;
        OpenAIStreamEvent::Chunk(chunk)
    };
    Ok(Some(NativeEvent::OpenAI(event)))
}
