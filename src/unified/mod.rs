//! 协议无关的统一数据模型
//!
//! 所有协议的请求、响应和流式增量都先归一到这里，再由目标协议的
//! materializer 生成原生事件。流式 chunk 是增量而非快照，消费方需要自行累积
//! （见 [`accumulator::StreamAccumulator`]）。

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod accumulator;

pub use accumulator::StreamAccumulator;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 内容片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Refusal { refusal: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// 片段中承载的文本，不区分 text / refusal
    pub fn as_str(&self) -> &str {
        match self {
            ContentPart::Text { text } => text,
            ContentPart::Refusal { refusal } => refusal,
        }
    }
}

/// 完整的工具调用（非流式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON 字符串形式的参数
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// role 为 tool 时对应的调用 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl UnifiedMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool { name: String },
}

/// 思考/推理开关
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// 统一请求，构造后不可变
///
/// 只能通过 [`UnifiedChatRequestBuilder`] 或反序列化得到，两条路径都会校验
/// model 非空、messages 非空。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChatRequest")]
pub struct UnifiedChatRequest {
    model: String,
    messages: Vec<UnifiedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
    stream: bool,
    /// 厂商特有字段，原样透传
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawChatRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<UnifiedMessage>,
    system: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
    tools: Option<Vec<ToolDefinition>>,
    tool_choice: Option<ToolChoice>,
    thinking: Option<ThinkingConfig>,
    #[serde(default)]
    stream: bool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawChatRequest> for UnifiedChatRequest {
    type Error = Error;

    fn try_from(raw: RawChatRequest) -> Result<Self> {
        let mut builder = UnifiedChatRequest::builder(raw.model);
        builder.messages = raw.messages;
        builder.system = raw.system;
        builder.temperature = raw.temperature;
        builder.top_p = raw.top_p;
        builder.max_tokens = raw.max_tokens;
        builder.tools = raw.tools;
        builder.tool_choice = raw.tool_choice;
        builder.thinking = raw.thinking;
        builder.stream = raw.stream;
        builder.extra = raw.extra;
        builder.build()
    }
}

impl UnifiedChatRequest {
    pub fn builder(model: impl Into<String>) -> UnifiedChatRequestBuilder {
        UnifiedChatRequestBuilder {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[UnifiedMessage] {
        &self.messages
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn tools(&self) -> Option<&[ToolDefinition]> {
        self.tools.as_deref()
    }

    pub fn tool_choice(&self) -> Option<&ToolChoice> {
        self.tool_choice.as_ref()
    }

    pub fn thinking(&self) -> Option<&ThinkingConfig> {
        self.thinking.as_ref()
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnifiedChatRequestBuilder {
    model: String,
    messages: Vec<UnifiedMessage>,
    system: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
    tools: Option<Vec<ToolDefinition>>,
    tool_choice: Option<ToolChoice>,
    thinking: Option<ThinkingConfig>,
    stream: bool,
    extra: Map<String, Value>,
}

impl UnifiedChatRequestBuilder {
    pub fn message(mut self, message: UnifiedMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.get_or_insert_with(Vec::new).push(tool);
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn thinking(mut self, thinking: ThinkingConfig) -> Self {
        self.thinking = Some(thinking);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<UnifiedChatRequest> {
        if self.model.trim().is_empty() {
            return Err(Error::InvalidRequest("model is required".into()));
        }
        if self.messages.is_empty() {
            return Err(Error::InvalidRequest("messages must not be empty".into()));
        }

        Ok(UnifiedChatRequest {
            model: self.model,
            messages: self.messages,
            system: self.system,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            tools: self.tools,
            tool_choice: self.tool_choice,
            thinking: self.thinking,
            stream: self.stream,
            extra: self.extra,
        })
    }
}

/// 结束原因，统一采用 OpenAI 词汇
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(other) => other,
        }
    }
}

impl From<&str> for FinishReason {
    fn from(value: &str) -> Self {
        match value {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl Serialize for FinishReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(FinishReason::from(value.as_str()))
    }
}

/// token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UnifiedUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedChoice {
    pub index: u32,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
}

/// 统一响应（非流式或累积完成的流）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<UnifiedChoice>,
    pub usage: Option<UnifiedUsage>,
}

/// 流式工具调用片段
///
/// `index` 是来源协议给的调用序号；`id` 和 `name` 通常只在第一个片段出现
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    pub fn start(index: u32, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments: None,
        }
    }

    pub fn arguments(index: u32, arguments: impl Into<String>) -> Self {
        Self {
            index,
            arguments: Some(arguments.into()),
            ..Default::default()
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    pub fn has_arguments(&self) -> bool {
        self.arguments.as_deref().is_some_and(|a| !a.is_empty())
    }
}

/// 单个 choice 的增量
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// 来源协议提供的 thinking 签名片段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl ChoiceDelta {
    pub fn has_text(&self) -> bool {
        self.content.iter().any(|part| !part.as_str().is_empty())
    }

    pub fn has_reasoning(&self) -> bool {
        self.reasoning.as_deref().is_some_and(|r| !r.is_empty())
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// 拼接本增量中的全部文本片段
    pub fn text(&self) -> String {
        self.content.iter().map(ContentPart::as_str).collect()
    }
}

/// 统一流式 chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedStreamChunk {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub choices: Vec<ChoiceDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UnifiedUsage>,
}

impl UnifiedStreamChunk {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            choices: Vec::new(),
            usage: None,
        }
    }

    pub fn with_delta(mut self, delta: ChoiceDelta) -> Self {
        self.choices.push(delta);
        self
    }

    pub fn with_usage(mut self, usage: UnifiedUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// 第一个 choice 的增量；本网关只转码单 choice 流
    pub fn primary(&self) -> Option<&ChoiceDelta> {
        self.choices.first()
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.choices.iter().find_map(|c| c.finish_reason.as_ref())
    }
}
