use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::InferenceError;
use crate::image::{load_image, ImageFetchService};
use super::REDACTED_THINKING_DATA;
use crate::providers::{
    merge_alternating_turns, non_empty_text, str_field, MessageConverter, WireTurn,
};
use crate::types::{ContentPart, ConversionRequest, Message, Tool, ToolChoice};

pub const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicConverter {
    pub max_tokens: u64,
    /// Zero disables extended thinking.
    pub thinking_budget: u64,
}

impl Default for AnthropicConverter {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            thinking_budget: 0,
        }
    }
}

impl AnthropicConverter {
    fn thinking_enabled(&self) -> bool {
        self.thinking_budget > 0
    }

    fn convert_tool_choice(&self, request: &ConversionRequest) -> Result<Value, InferenceError> {
        if self.thinking_enabled() && request.tool_choice != ToolChoice::Auto {
            return Err(InferenceError::conversion(
                "Anthropic extended thinking only supports tool choice auto",
            ));
        }
        match &request.tool_choice {
            ToolChoice::Auto => Ok(json!({ "type": "auto" })),
            ToolChoice::Required => Ok(json!({ "type": "any" })),
            ToolChoice::Named(name) => {
                if !request.tools.iter().any(|tool| &tool.name == name) {
                    return Err(InferenceError::conversion(format!(
                        "tool choice names unknown tool '{name}'"
                    )));
                }
                Ok(json!({ "type": "tool", "name": name }))
            }
        }
    }
}

#[async_trait]
impl MessageConverter for AnthropicConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
        images: Option<&dyn ImageFetchService>,
    ) -> Result<Value, InferenceError> {
        let max_tokens = if self.thinking_enabled() {
            self.max_tokens.max(self.thinking_budget + 1024)
        } else {
            self.max_tokens
        };

        let mut payload = json!({
            "model": request.model,
            "stream": true,
            "max_tokens": max_tokens,
            "messages": convert_messages(request, images).await?,
        });

        if let Some(system_prompt) = request.effective_system_prompt() {
            payload["system"] = Value::String(system_prompt);
        }
        if !request.tools.is_empty() {
            payload["tools"] = convert_tools(&request.tools);
            payload["tool_choice"] = self.convert_tool_choice(request)?;
        } else if request.tool_choice != ToolChoice::Auto {
            return Err(InferenceError::conversion(
                "tool choice other than auto requires at least one tool",
            ));
        }
        if self.thinking_enabled() {
            payload["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": self.thinking_budget,
            });
        }

        debug!(model = %request.model, payload = %payload, "anthropic payload");
        Ok(payload)
    }
}

async fn convert_messages(
    request: &ConversionRequest,
    images: Option<&dyn ImageFetchService>,
) -> Result<Vec<Value>, InferenceError> {
    let mut turns = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        match message {
            Message::System { .. } => {}
            Message::User { content } => {
                let mut blocks = Vec::new();
                for part in content {
                    match part {
                        ContentPart::Text { text, .. } if !text.is_empty() => {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                        ContentPart::Image { image } => {
                            let fetched = load_image(images, image, &request.context).await?;
                            blocks.push(json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": fetched.content_type,
                                    "data": fetched.base64(),
                                },
                            }));
                        }
                        _ => {}
                    }
                }
                turns.push(WireTurn::new("user", blocks));
            }
            Message::Assistant { content } => {
                let blocks = content.iter().filter_map(convert_assistant_part).collect();
                turns.push(WireTurn::new("assistant", blocks));
            }
            Message::ToolResult { content } => {
                let blocks = content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::ToolResult {
                            tool_use_id,
                            output,
                            is_error,
                            ..
                        } => Some(json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": non_empty_text(output),
                            "is_error": is_error,
                        })),
                        _ => None,
                    })
                    .collect();
                turns.push(WireTurn::new("user", blocks));
            }
        }
    }

    Ok(merge_alternating_turns(turns, "assistant")
        .into_iter()
        .map(|turn| json!({ "role": turn.role, "content": turn.parts }))
        .collect())
}

fn convert_assistant_part(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text, .. } if !text.is_empty() => {
            Some(json!({ "type": "text", "text": text }))
        }
        ContentPart::Thinking {
            provider_metadata: Some(metadata),
            ..
        } if str_field(metadata, REDACTED_THINKING_DATA).is_some() => Some(json!({
            "type": "redacted_thinking",
            "data": str_field(metadata, REDACTED_THINKING_DATA),
        })),
        // Unsigned thinking cannot be replayed to Anthropic.
        ContentPart::Thinking {
            text,
            signature: Some(signature),
            ..
        } => Some(json!({
            "type": "thinking",
            "thinking": text,
            "signature": signature,
        })),
        ContentPart::ToolUse {
            id, name, params, ..
        } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": params,
        })),
        _ => None,
    }
}

fn convert_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect(),
    )
}
