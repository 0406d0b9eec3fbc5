//! OpenAI Responses API. Input items map 1:1 to domain content parts and
//! the stream is a sequence of typed `response.*` events.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    non_empty_text, str_field, u64_field, vendor_error_event, ChunkDecoder, MessageConverter,
};
use crate::chunk::{ChunkUsage, FinishReason, ToolCallDelta, UnifiedChunk};
use crate::error::InferenceError;
use crate::image::{load_image, ImageFetchService};
use crate::types::{ContentPart, ConversionRequest, Message, Tool, ToolChoice};

#[derive(Debug, Clone, Default)]
pub struct OpenAiResponsesConverter {
    pub max_tokens: Option<u64>,
    /// Ask for reasoning summaries and encrypted reasoning items.
    pub reasoning: bool,
}

#[async_trait]
impl MessageConverter for OpenAiResponsesConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
        images: Option<&dyn ImageFetchService>,
    ) -> Result<Value, InferenceError> {
        let mut payload = json!({
            "model": request.model,
            "stream": true,
            "store": false,
            "input": convert_input(request, images).await?,
        });

        if let Some(instructions) = request.effective_system_prompt() {
            payload["instructions"] = Value::String(instructions);
        }
        if let Some(max_tokens) = self.max_tokens {
            payload["max_output_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            payload["tools"] = convert_tools(&request.tools);
            payload["tool_choice"] = convert_tool_choice(request)?;
            payload["parallel_tool_calls"] = json!(true);
        } else if request.tool_choice != ToolChoice::Auto {
            return Err(InferenceError::conversion(
                "tool choice other than auto requires at least one tool",
            ));
        }
        if self.reasoning {
            payload["reasoning"] = json!({ "effort": "medium", "summary": "auto" });
            payload["include"] = json!(["reasoning.encrypted_content"]);
        }

        debug!(model = %request.model, payload = %payload, "openai responses payload");
        Ok(payload)
    }
}

async fn convert_input(
    request: &ConversionRequest,
    images: Option<&dyn ImageFetchService>,
) -> Result<Vec<Value>, InferenceError> {
    let mut items = Vec::new();

    for message in &request.messages {
        match message {
            Message::System { .. } => {}
            Message::User { content } => {
                let mut converted = Vec::new();
                for part in content {
                    match part {
                        ContentPart::Text { text, .. } if !text.is_empty() => {
                            converted.push(json!({ "type": "input_text", "text": text }));
                        }
                        ContentPart::Image { image } => {
                            let fetched = load_image(images, image, &request.context).await?;
                            converted.push(json!({
                                "type": "input_image",
                                "detail": "auto",
                                "image_url": fetched.data_url(),
                            }));
                        }
                        _ => {}
                    }
                }
                if !converted.is_empty() {
                    items.push(json!({ "role": "user", "content": converted }));
                }
            }
            Message::Assistant { content } => {
                for part in content {
                    match part {
                        ContentPart::Text { text, .. } if !text.is_empty() => items.push(json!({
                            "type": "message",
                            "role": "assistant",
                            "content": [{ "type": "output_text", "text": text, "annotations": [] }],
                        })),
                        ContentPart::Thinking {
                            text,
                            id: Some(id),
                            signature,
                            ..
                        } => {
                            let mut item = json!({
                                "type": "reasoning",
                                "id": id,
                                "summary": if text.is_empty() {
                                    json!([])
                                } else {
                                    json!([{ "type": "summary_text", "text": text }])
                                },
                            });
                            if let Some(encrypted) = signature {
                                item["encrypted_content"] = json!(encrypted);
                            }
                            items.push(item);
                        }
                        ContentPart::ToolUse {
                            id, name, params, ..
                        } => items.push(json!({
                            "type": "function_call",
                            "call_id": id,
                            "name": name,
                            "arguments": params.to_string(),
                        })),
                        _ => {}
                    }
                }
            }
            Message::ToolResult { content } => {
                for part in content {
                    if let ContentPart::ToolResult {
                        tool_use_id,
                        output,
                        ..
                    } = part
                    {
                        items.push(json!({
                            "type": "function_call_output",
                            "call_id": tool_use_id,
                            "output": non_empty_text(output),
                        }));
                    }
                }
            }
        }
    }

    Ok(items)
}

fn convert_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                    "strict": true,
                })
            })
            .collect(),
    )
}

fn convert_tool_choice(request: &ConversionRequest) -> Result<Value, InferenceError> {
    match &request.tool_choice {
        ToolChoice::Auto => Ok(json!("auto")),
        ToolChoice::Required => Ok(json!("required")),
        ToolChoice::Named(name) => {
            if !request.tools.iter().any(|tool| &tool.name == name) {
                return Err(InferenceError::conversion(format!(
                    "tool choice names unknown tool '{name}'"
                )));
            }
            Ok(json!({ "type": "function", "name": name }))
        }
    }
}

/// The Responses stream has no native tool index: calls are keyed by
/// `call_id` (falling back to the item id) and numbered in first-seen order.
#[derive(Debug, Default)]
pub struct OpenAiResponsesDecoder {
    call_indices: HashMap<String, usize>,
    item_indices: HashMap<String, usize>,
    finished: bool,
}

impl OpenAiResponsesDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_call(&mut self, item: &Value) -> Option<UnifiedChunk> {
        let item_id = str_field(item, "id").unwrap_or_default();
        let call_id = str_field(item, "call_id")
            .filter(|call_id| !call_id.is_empty())
            .unwrap_or(item_id);
        if call_id.is_empty() {
            return None;
        }

        let next = self.call_indices.len();
        let index = *self.call_indices.entry(call_id.to_string()).or_insert(next);
        if !item_id.is_empty() {
            self.item_indices.insert(item_id.to_string(), index);
        }

        let name = str_field(item, "name").unwrap_or_default();
        let mut delta = ToolCallDelta::start(index, call_id, name);
        delta.arguments_delta = str_field(item, "arguments")
            .filter(|arguments| !arguments.is_empty())
            .map(str::to_string);
        Some(UnifiedChunk::tool_calls(vec![delta]))
    }

    fn resolve_call_index(&self, event: &Value) -> Option<usize> {
        if let Some(index) = str_field(event, "item_id").and_then(|id| self.item_indices.get(id)) {
            return Some(*index);
        }
        if let Some(index) = str_field(event, "call_id").and_then(|id| self.call_indices.get(id)) {
            return Some(*index);
        }
        if self.call_indices.len() == 1 {
            return self.call_indices.values().next().copied();
        }
        None
    }

    fn complete(&mut self, response: &Value, incomplete: bool) -> UnifiedChunk {
        self.finished = true;
        let usage = response.get("usage").map(|usage| ChunkUsage {
            input_tokens: u64_field(usage, "input_tokens"),
            output_tokens: u64_field(usage, "output_tokens"),
        });
        let reason = if incomplete {
            match response
                .get("incomplete_details")
                .and_then(|details| str_field(details, "reason"))
            {
                Some("content_filter") => FinishReason::ContentFilter,
                _ => FinishReason::Length,
            }
        } else if self.call_indices.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        UnifiedChunk::terminal(reason, usage)
    }
}

impl ChunkDecoder for OpenAiResponsesDecoder {
    fn decode(&mut self, event: &Value) -> Result<Vec<UnifiedChunk>, InferenceError> {
        if self.finished {
            return Ok(Vec::new());
        }

        let chunk = match str_field(event, "type").unwrap_or_default() {
            "error" => {
                let message = str_field(event, "message").unwrap_or("unknown error");
                return Err(vendor_error_event("OpenAI responses", event).unwrap_or_else(|| {
                    InferenceError::interrupted(format!("OpenAI responses error: {message}"))
                }));
            }
            "response.failed" => {
                let message = event
                    .get("response")
                    .and_then(|response| response.get("error"))
                    .and_then(|error| str_field(error, "message"))
                    .unwrap_or("response failed");
                return Err(InferenceError::interrupted(format!(
                    "OpenAI responses failed: {message}"
                )));
            }
            "response.output_item.added" => event
                .get("item")
                .filter(|item| str_field(item, "type") == Some("function_call"))
                .and_then(|item| self.register_call(item)),
            "response.function_call_arguments.delta" => {
                let delta = str_field(event, "delta").filter(|delta| !delta.is_empty());
                match (delta, self.resolve_call_index(event)) {
                    (Some(delta), Some(index)) => Some(UnifiedChunk::tool_calls(vec![
                        ToolCallDelta::arguments(index, delta),
                    ])),
                    _ => None,
                }
            }
            "response.output_text.delta" | "response.refusal.delta" => str_field(event, "delta")
                .filter(|delta| !delta.is_empty())
                .map(UnifiedChunk::text),
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                str_field(event, "delta")
                    .filter(|delta| !delta.is_empty())
                    .map(UnifiedChunk::thinking)
            }
            "response.output_item.done" => event
                .get("item")
                .filter(|item| str_field(item, "type") == Some("reasoning"))
                .map(|item| UnifiedChunk {
                    thinking_id: str_field(item, "id").map(str::to_string),
                    thinking_signature: str_field(item, "encrypted_content").map(str::to_string),
                    ..UnifiedChunk::default()
                }),
            "response.completed" => event
                .get("response")
                .map(|response| self.complete(response, false)),
            "response.incomplete" => event
                .get("response")
                .map(|response| self.complete(response, true)),
            _ => None,
        };

        Ok(chunk.into_iter().filter(UnifiedChunk::should_emit).collect())
    }
}
