//! OpenAI Chat Completions and compatible servers.

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

/// Tool output meaning "nothing to do until the user replies".
pub const TOOL_RESULT_AWAITING_USER: &str = "OK. Waiting for the user's response.";
/// Assistant turn appended after a turn made only of awaiting-user results,
/// so the model does not call the same tool again.
pub const SYNTHETIC_AWAITING_USER_TEXT: &str = "Awaiting user input.";

#[derive(Debug, Clone)]
pub struct OpenAiChatConverter {
    pub max_tokens: Option<u64>,
    pub supports_required_tool_choice: bool,
}

impl Default for OpenAiChatConverter {
    fn default() -> Self {
        Self {
            max_tokens: None,
            supports_required_tool_choice: true,
        }
    }
}

#[async_trait]
impl MessageConverter for OpenAiChatConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
        images: Option<&dyn ImageFetchService>,
    ) -> Result<Value, InferenceError> {
        let mut payload = json!({
            "model": request.model,
            "stream": true,
            "stream_options": { "include_usage": true },
            "messages": convert_messages(request, images).await?,
        });

        if let Some(max_tokens) = self.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            payload["tools"] = convert_tools(&request.tools);
            payload["tool_choice"] = self.convert_tool_choice(request)?;
        } else if request.tool_choice != ToolChoice::Auto {
            return Err(InferenceError::conversion(
                "tool choice other than auto requires at least one tool",
            ));
        }

        debug!(model = %request.model, payload = %payload, "openai chat payload");
        Ok(payload)
    }
}

impl OpenAiChatConverter {
    fn convert_tool_choice(&self, request: &ConversionRequest) -> Result<Value, InferenceError> {
        match &request.tool_choice {
            ToolChoice::Auto => Ok(json!("auto")),
            ToolChoice::Required if self.supports_required_tool_choice => Ok(json!("required")),
            ToolChoice::Named(name) if self.supports_required_tool_choice => {
                if !request.tools.iter().any(|tool| &tool.name == name) {
                    return Err(InferenceError::conversion(format!(
                        "tool choice names unknown tool '{name}'"
                    )));
                }
                Ok(json!({ "type": "function", "function": { "name": name } }))
            }
            ToolChoice::Required | ToolChoice::Named(_) => Err(InferenceError::conversion(
                "this OpenAI-compatible server does not support forced tool choice",
            )),
        }
    }
}

async fn convert_messages(
    request: &ConversionRequest,
    images: Option<&dyn ImageFetchService>,
) -> Result<Vec<Value>, InferenceError> {
    let mut messages = Vec::new();

    if let Some(system_prompt) = request.effective_system_prompt() {
        messages.push(json!({
            "role": "system",
            "content": system_prompt,
        }));
    }

    for message in &request.messages {
        match message {
            Message::System { .. } => {}
            Message::User { content } => {
                let mut converted = Vec::new();
                for part in content {
                    match part {
                        ContentPart::Text { text, .. } if !text.is_empty() => {
                            converted.push(json!({ "type": "text", "text": text }));
                        }
                        ContentPart::Image { image } => {
                            let fetched = load_image(images, image, &request.context).await?;
                            converted.push(json!({
                                "type": "image_url",
                                "image_url": { "url": fetched.data_url() },
                            }));
                        }
                        _ => {}
                    }
                }
                if !converted.is_empty() {
                    messages.push(json!({ "role": "user", "content": converted }));
                }
            }
            Message::Assistant { content } => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for part in content {
                    match part {
                        ContentPart::Text { text, .. } if !text.is_empty() => {
                            text_parts.push(text.as_str());
                        }
                        ContentPart::ToolUse {
                            id, name, params, ..
                        } => tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": params.to_string(),
                            },
                        })),
                        _ => {}
                    }
                }
                if text_parts.is_empty() && tool_calls.is_empty() {
                    continue;
                }

                let mut assistant = json!({
                    "role": "assistant",
                    "content": if text_parts.is_empty() {
                        Value::Null
                    } else {
                        Value::String(text_parts.join("\n"))
                    },
                });
                if !tool_calls.is_empty() {
                    assistant["tool_calls"] = Value::Array(tool_calls);
                }
                messages.push(assistant);
            }
            Message::ToolResult { content } => {
                let mut result_count = 0usize;
                let mut all_awaiting_user = true;
                for part in content {
                    if let ContentPart::ToolResult {
                        tool_use_id,
                        output,
                        ..
                    } = part
                    {
                        result_count += 1;
                        all_awaiting_user &= output == TOOL_RESULT_AWAITING_USER;
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": non_empty_text(output),
                        }));
                    }
                }
                if result_count > 0 && all_awaiting_user {
                    messages.push(json!({
                        "role": "assistant",
                        "content": SYNTHETIC_AWAITING_USER_TEXT,
                    }));
                }
            }
        }
    }

    Ok(messages)
}

fn convert_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

/// Holds the finish reason back until the trailing usage event so the
/// terminal chunk carries the final token counts.
#[derive(Debug, Default)]
pub struct OpenAiChatDecoder {
    pending_finish: Option<FinishReason>,
    finished: bool,
}

impl OpenAiChatDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkDecoder for OpenAiChatDecoder {
    fn decode(&mut self, event: &Value) -> Result<Vec<UnifiedChunk>, InferenceError> {
        if self.finished {
            return Ok(Vec::new());
        }
        if let Some(error) = vendor_error_event("OpenAI", event) {
            return Err(error);
        }

        let mut chunks = Vec::new();
        let choice = event
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first());

        if let Some(choice) = choice {
            if let Some(delta) = choice.get("delta") {
                let reasoning = str_field(delta, "reasoning_content")
                    .or_else(|| str_field(delta, "reasoning"))
                    .unwrap_or_default();
                if !reasoning.is_empty() {
                    chunks.push(UnifiedChunk::thinking(reasoning));
                }

                let text = str_field(delta, "content").unwrap_or_default();
                if !text.is_empty() {
                    chunks.push(UnifiedChunk::text(text));
                }

                let deltas = delta
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| calls.iter().map(tool_call_delta).collect::<Vec<_>>())
                    .unwrap_or_default();
                if !deltas.is_empty() {
                    chunks.push(UnifiedChunk::tool_calls(deltas));
                }
            }

            if let Some(reason) = str_field(choice, "finish_reason") {
                self.pending_finish = Some(map_finish_reason(reason));
            }
        }

        if let Some(usage) = event.get("usage").filter(|usage| usage.is_object()) {
            let usage = ChunkUsage {
                input_tokens: u64_field(usage, "prompt_tokens"),
                output_tokens: u64_field(usage, "completion_tokens"),
            };
            match self.pending_finish.take() {
                Some(reason) => {
                    self.finished = true;
                    chunks.push(UnifiedChunk::terminal(reason, Some(usage)));
                }
                None => chunks.push(UnifiedChunk::usage(usage)),
            }
        }

        Ok(chunks)
    }

    fn finish(&mut self) -> Vec<UnifiedChunk> {
        if self.finished {
            return Vec::new();
        }
        match self.pending_finish.take() {
            Some(reason) => {
                self.finished = true;
                vec![UnifiedChunk::terminal(reason, None)]
            }
            None => Vec::new(),
        }
    }
}

fn tool_call_delta(call: &Value) -> ToolCallDelta {
    let function = call.get("function");
    ToolCallDelta {
        index: u64_field(call, "index").unwrap_or(0) as usize,
        id: str_field(call, "id").map(str::to_string),
        name: function
            .and_then(|function| str_field(function, "name"))
            .map(str::to_string),
        arguments_delta: function
            .and_then(|function| str_field(function, "arguments"))
            .filter(|arguments| !arguments.is_empty())
            .map(str::to_string),
        provider_metadata: None,
    }
}

pub(crate) fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}
