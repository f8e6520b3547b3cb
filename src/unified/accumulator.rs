use super::{
    ContentPart, FinishReason, Role, ToolCall, UnifiedChatResponse, UnifiedChoice,
    UnifiedStreamChunk, UnifiedUsage,
};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug)]
struct ChoiceBuilder {
    role: Role,
    text: String,
    refusal: String,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCallBuilder>,
    finish_reason: Option<FinishReason>,
}

impl Default for ChoiceBuilder {
    fn default() -> Self {
        Self {
            role: Role::Assistant,
            text: String::new(),
            refusal: String::new(),
            reasoning: String::new(),
            tool_calls: BTreeMap::new(),
            finish_reason: None,
        }
    }
}

/// 把统一流式 chunk 累积成完整响应
///
/// 工具调用按片段的 `index` 归并，id/name 以第一次出现的值为准
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    id: Option<String>,
    model: Option<String>,
    choices: BTreeMap<u32, ChoiceBuilder>,
    usage: Option<UnifiedUsage>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &UnifiedStreamChunk) {
        if self.id.is_none() && !chunk.id.is_empty() {
            self.id = Some(chunk.id.clone());
        }
        if self.model.is_none() && !chunk.model.is_empty() {
            self.model = Some(chunk.model.clone());
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        for delta in &chunk.choices {
            let choice = self.choices.entry(delta.index).or_default();
            if let Some(role) = delta.role {
                choice.role = role;
            }
            for part in &delta.content {
                match part {
                    ContentPart::Text { text } => choice.text.push_str(text),
                    ContentPart::Refusal { refusal } => choice.refusal.push_str(refusal),
                }
            }
            if let Some(reasoning) = &delta.reasoning {
                choice.reasoning.push_str(reasoning);
            }
            for fragment in &delta.tool_calls {
                let call = choice.tool_calls.entry(fragment.index).or_default();
                if call.id.is_none() {
                    call.id = fragment.id.clone();
                }
                if call.name.is_none() {
                    call.name = fragment.name.clone();
                }
                if let Some(arguments) = &fragment.arguments {
                    call.arguments.push_str(arguments);
                }
            }
            if let Some(reason) = &delta.finish_reason {
                choice.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn finish(self) -> UnifiedChatResponse {
        let choices = self
            .choices
            .into_iter()
            .map(|(index, builder)| {
                let mut content = Vec::new();
                if !builder.text.is_empty() {
                    content.push(ContentPart::Text { text: builder.text });
                }
                if !builder.refusal.is_empty() {
                    content.push(ContentPart::Refusal {
                        refusal: builder.refusal,
                    });
                }
                UnifiedChoice {
                    index,
                    role: builder.role,
                    content,
                    reasoning: (!builder.reasoning.is_empty()).then_some(builder.reasoning),
                    tool_calls: builder
                        .tool_calls
                        .into_values()
                        .map(|call| ToolCall {
                            id: call.id.unwrap_or_default(),
                            name: call.name.unwrap_or_default(),
                            arguments: call.arguments,
                        })
                        .collect(),
                    finish_reason: builder.finish_reason,
                }
            })
            .collect();

        UnifiedChatResponse {
            id: self.id.unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            choices,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unified::{ChoiceDelta, ToolCallDelta};

    fn chunk(delta: ChoiceDelta) -> UnifiedStreamChunk {
        UnifiedStreamChunk::new("chatcmpl-1", "gpt-4o", 0).with_delta(delta)
    }

    #[test]
    fn accumulates_text_and_tool_calls() {
        let mut acc = StreamAccumulator::new();
        acc.push(&chunk(ChoiceDelta {
            role: Some(Role::Assistant),
            content: vec![ContentPart::text("Hel")],
            ..Default::default()
        }));
        acc.push(&chunk(ChoiceDelta {
            content: vec![ContentPart::text("lo")],
            ..Default::default()
        }));
        acc.push(&chunk(ChoiceDelta {
            tool_calls: vec![ToolCallDelta::start(0, "call_1", "lookup").with_arguments("{\"q\":")],
            ..Default::default()
        }));
        acc.push(&chunk(ChoiceDelta {
            tool_calls: vec![ToolCallDelta::arguments(0, "\"x\"}")],
            finish_reason: Some(FinishReason::ToolCalls),
            ..Default::default()
        }));
        acc.push(&UnifiedStreamChunk::new("chatcmpl-1", "gpt-4o", 0).with_usage(UnifiedUsage::new(7, 4)));

        let response = acc.finish();
        assert_eq!(response.id, "chatcmpl-1");
        let choice = &response.choices[0];
        assert_eq!(choice.content[0].as_str(), "Hello");
        assert_eq!(choice.tool_calls[0].id, "call_1");
        assert_eq!(choice.tool_calls[0].arguments, "{\"q\":\"x\"}");
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(11));
    }
}
