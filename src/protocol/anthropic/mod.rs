//! Anthropic Messages 流式协议（block 流）
//!
//! ```text
//! event: message_start
//! data: {"type":"message_start","message":{...}}
//!
//! event: content_block_start
//! data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}
//!
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}
//!
//! event: content_block_stop
//! data: {"type":"content_block_stop","index":0}
//!
//! event: message_delta
//! data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}
//!
//! event: message_stop
//! data: {"type":"message_stop"}
//! ```

use super::sse::SseFrame;
use super::NativeEvent;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod materializer;
pub mod normalizer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
}

impl AnthropicStreamEvent {
    /// SSE `event:` 字段的取值
    pub fn event_name(&self) -> &'static str {
        match self {
            AnthropicStreamEvent::MessageStart { .. } => "message_start",
            AnthropicStreamEvent::ContentBlockStart { .. } => "content_block_start",
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            AnthropicStreamEvent::MessageDelta { .. } => "message_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
            AnthropicStreamEvent::Ping => "ping",
            AnthropicStreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStart {
    pub id: String,
    #[serde(rename = "type", default = "message_type")]
    pub message_type: String,
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

fn message_type() -> String {
    "message".to_string()
}

fn assistant_role() -> String {
    "assistant".to_string()
}

impl MessageStart {
    pub fn new(id: impl Into<String>, model: impl Into<String>, input_tokens: u64) -> Self {
        Self {
            id: id.into(),
            message_type: message_type(),
            role: assistant_role(),
            content: Vec::new(),
            model: model.into(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage {
                input_tokens,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl Usage {
    /// 全部输入 token，含缓存命中和缓存写入
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.cache_creation_input_tokens.unwrap_or(0))
            .saturating_add(self.cache_read_input_tokens.unwrap_or(0))
    }
}

/// message_delta 中的累计用量，input_tokens 只有较新的 API 才会带
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl DeltaUsage {
    pub fn prompt_tokens(&self) -> Option<u64> {
        self.input_tokens.map(|input| {
            input
                .saturating_add(self.cache_creation_input_tokens.unwrap_or(0))
                .saturating_add(self.cache_read_input_tokens.unwrap_or(0))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// 把一个 SSE 帧解码成 Anthropic 事件
///
/// 事件类型以 data 里的 `type` 字段为准，`event:` 行只用于诊断
pub fn decode_frame(frame: &SseFrame) -> Result<Option<NativeEvent>> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    let event: AnthropicStreamEvent = serde_json::from_str(data).map_err(|e| {
        Error::MalformedNativeEvent(format!(
            "anthropic event {:?}: {}",
            frame.event.as_deref().unwrap_or("<none>"),
            e
        ))
    })?;
    Ok(Some(NativeEvent::Anthropic(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_message_start() {
        let frame = SseFrame {
            event: Some("message_start".into()),
            data: json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1", "type": "message", "role": "assistant", "content": [],
                    "model": "claude-sonnet-4", "stop_reason": null, "stop_sequence": null,
                    "usage": {"input_tokens": 12, "output_tokens": 1}
                }
            })
            .to_string(),
        };
        let event = decode_frame(&frame).unwrap().unwrap();
        let NativeEvent::Anthropic(AnthropicStreamEvent::MessageStart { message }) = event else {
            panic!("expected message_start");
        };
        assert_eq!(message.id, "msg_1");
        assert_eq!(message.usage.input_tokens, 12);
    }

    #[test]
    fn unknown_event_type_is_malformed() {
        let frame = SseFrame {
            event: Some("mystery".into()),
            data: r#"{"type":"mystery"}"#.into(),
        };
        assert!(matches!(
            decode_frame(&frame),
            Err(Error::MalformedNativeEvent(_))
        ));
    }

    #[test]
    fn serializes_wire_shapes() {
        let delta = AnthropicStreamEvent::ContentBlockDelta {
            index: 2,
            delta: BlockDelta::InputJsonDelta {
                partial_json: "{\"a\"".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&delta).unwrap(),
            json!({"type": "content_block_delta", "index": 2, "delta": {"type": "input_json_delta", "partial_json": "{\"a\""}})
        );
        assert_eq!(
            serde_json::to_value(AnthropicStreamEvent::MessageStop).unwrap(),
            json!({"type": "message_stop"})
        );
        assert_eq!(delta.event_name(), "content_block_delta");
    }

    #[test]
    fn prompt_tokens_include_cache() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 0,
            cache_creation_input_tokens: Some(5),
            cache_read_input_tokens: Some(100),
        };
        assert_eq!(usage.prompt_tokens(), 115);
    }

    #[test]
    fn cache_counts_saturate_instead_of_overflowing() {
        let usage = Usage {
            input_tokens: u64::MAX,
            output_tokens: 0,
            cache_creation_input_tokens: Some(1),
            cache_read_input_tokens: Some(u64::MAX),
        };
        assert_eq!(usage.prompt_tokens(), u64::MAX);

        let delta = DeltaUsage {
            input_tokens: Some(u64::MAX),
            output_tokens: 1,
            cache_creation_input_tokens: Some(1),
            cache_read_input_tokens: None,
        };
        assert_eq!(delta.prompt_tokens(), Some(u64::MAX));
    }
}
