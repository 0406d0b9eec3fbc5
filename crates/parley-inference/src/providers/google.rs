//! Google Gemini `streamGenerateContent`. Turns alternate strictly between
//! `user` and `model`; thought signatures ride on individual parts.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{
    merge_alternating_turns, non_empty_text, str_field, u64_field, vendor_error_event,
    ChunkDecoder, MessageConverter, WireTurn,
};
use crate::chunk::{ChunkUsage, FinishReason, ToolCallDelta, UnifiedChunk};
use crate::error::InferenceError;
use crate::image::{load_image, ImageFetchService};
use crate::types::{ContentPart, ConversionRequest, Message, ProviderMetadata, Tool, ToolChoice};

pub const STREAM_ROUTE_SUFFIX: &str = ":streamGenerateContent?alt=sse";
const THOUGHT_SIGNATURE: &str = "thoughtSignature";

#[derive(Debug, Clone, Default)]
pub struct GoogleConverter {
    pub max_tokens: Option<u64>,
    /// Zero leaves thinking at the model default and hides thoughts.
    pub thinking_budget: u64,
}

#[async_trait]
impl MessageConverter for GoogleConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
        images: Option<&dyn ImageFetchService>,
    ) -> Result<Value, InferenceError> {
        let mut payload = json!({
            "model": request.model,
            "contents": convert_contents(request, images).await?,
        });

        if let Some(system_prompt) = request.effective_system_prompt() {
            payload["systemInstruction"] = json!({ "parts": [{ "text": system_prompt }] });
        }
        if !request.tools.is_empty() {
            payload["tools"] = convert_tools(&request.tools);
            payload["toolConfig"] = convert_tool_choice(request)?;
        } else if request.tool_choice != ToolChoice::Auto {
            return Err(InferenceError::conversion(
                "tool choice other than auto requires at least one tool",
            ));
        }

        let mut generation_config = Map::new();
        if let Some(max_tokens) = self.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if self.thinking_budget > 0 {
            generation_config.insert(
                "thinkingConfig".to_string(),
                json!({ "includeThoughts": true, "thinkingBudget": self.thinking_budget }),
            );
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }

        debug!(model = %request.model, payload = %payload, "google payload");
        Ok(payload)
    }
}

async fn convert_contents(
    request: &ConversionRequest,
    images: Option<&dyn ImageFetchService>,
) -> Result<Vec<Value>, InferenceError> {
    let mut turns = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        match message {
            Message::System { .. } => {}
            Message::User { content } => {
                let mut parts = Vec::new();
                for part in content {
                    match part {
                        ContentPart::Text { text, .. } if !text.is_empty() => {
                            parts.push(json!({ "text": text }));
                        }
                        ContentPart::Image { image } => {
                            let fetched = load_image(images, image, &request.context).await?;
                            parts.push(json!({
                                "inlineData": {
                                    "mimeType": fetched.content_type,
                                    "data": fetched.base64(),
                                }
                            }));
                        }
                        _ => {}
                    }
                }
                turns.push(WireTurn::new("user", parts));
            }
            Message::Assistant { content } => {
                let parts = content.iter().filter_map(convert_model_part).collect();
                turns.push(WireTurn::new("model", parts));
            }
            Message::ToolResult { content } => {
                let parts = content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::ToolResult {
                            tool_use_id,
                            tool_name,
                            output,
                            is_error,
                        } => {
                            let key = if *is_error { "error" } else { "output" };
                            Some(json!({
                                "functionResponse": {
                                    "id": tool_use_id,
                                    "name": tool_name,
                                    "response": { key: non_empty_text(output) },
                                }
                            }))
                        }
                        _ => None,
                    })
                    .collect();
                turns.push(WireTurn::new("user", parts));
            }
        }
    }

    Ok(merge_alternating_turns(turns, "model")
        .into_iter()
        .map(|turn| json!({ "role": turn.role, "parts": turn.parts }))
        .collect())
}

fn convert_model_part(part: &ContentPart) -> Option<Value> {
    let (mut converted, signature) = match part {
        ContentPart::Text {
            text,
            provider_metadata,
        } if !text.is_empty() => (
            json!({ "text": text }),
            metadata_signature(provider_metadata.as_ref()),
        ),
        ContentPart::Thinking {
            text,
            signature,
            provider_metadata,
            ..
        } => (
            json!({ "text": text, "thought": true }),
            signature
                .clone()
                .or_else(|| metadata_signature(provider_metadata.as_ref())),
        ),
        ContentPart::ToolUse {
            id,
            name,
            params,
            provider_metadata,
        } => {
            let mut call = json!({ "name": name, "args": params });
            if !id.is_empty() {
                call["id"] = json!(id);
            }
            (
                json!({ "functionCall": call }),
                metadata_signature(provider_metadata.as_ref()),
            )
        }
        _ => return None,
    };
    if let Some(signature) = signature {
        converted[THOUGHT_SIGNATURE] = Value::String(signature);
    }
    Some(converted)
}

fn metadata_signature(metadata: Option<&ProviderMetadata>) -> Option<String> {
    metadata
        .and_then(|metadata| str_field(metadata, THOUGHT_SIGNATURE))
        .map(str::to_string)
}

fn signature_metadata(signature: &str) -> ProviderMetadata {
    json!({ THOUGHT_SIGNATURE: signature })
}

fn convert_tools(tools: &[Tool]) -> Value {
    json!([{
        "functionDeclarations": tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect::<Vec<_>>()
    }])
}

fn convert_tool_choice(request: &ConversionRequest) -> Result<Value, InferenceError> {
    let config = match &request.tool_choice {
        ToolChoice::Auto => json!({ "mode": "AUTO" }),
        ToolChoice::Required => json!({ "mode": "ANY" }),
        ToolChoice::Named(name) => {
            if !request.tools.iter().any(|tool| &tool.name == name) {
                return Err(InferenceError::conversion(format!(
                    "tool choice names unknown tool '{name}'"
                )));
            }
            json!({ "mode": "ANY", "allowedFunctionNames": [name] })
        }
    };
    Ok(json!({ "functionCallingConfig": config }))
}

/// Gemini repeats cumulative usage on every event; the latest value of each
/// count is reported on the terminal chunk, even when the two counts last
/// appeared in different events. Function calls arrive whole, so each
/// gets the next dense index.
#[derive(Debug, Default)]
pub struct GoogleDecoder {
    next_tool_index: usize,
    usage: Option<ChunkUsage>,
    finished: bool,
}

impl GoogleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_part(&mut self, part: &Value) -> Option<UnifiedChunk> {
        let signature = str_field(part, THOUGHT_SIGNATURE).filter(|s| !s.is_empty());

        if let Some(call) = part.get("functionCall") {
            let index = self.next_tool_index;
            self.next_tool_index += 1;
            let name = str_field(call, "name").unwrap_or_default();
            let id = str_field(call, "id")
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{index}"));
            let arguments = call
                .get("args")
                .filter(|args| !args.is_null())
                .map(Value::to_string)
                .unwrap_or_else(|| "{}".to_string());
            let mut delta = ToolCallDelta::start(index, id, name);
            delta.arguments_delta = Some(arguments);
            delta.provider_metadata = signature.map(signature_metadata);
            return Some(UnifiedChunk::tool_calls(vec![delta]));
        }

        let text = str_field(part, "text").unwrap_or_default();
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            return Some(UnifiedChunk {
                thinking_delta: Some(text.to_string()).filter(|text| !text.is_empty()),
                thinking_signature: signature.map(str::to_string),
                ..UnifiedChunk::default()
            });
        }

        Some(UnifiedChunk {
            text_delta: Some(text.to_string()).filter(|text| !text.is_empty()),
            text_provider_metadata: signature.map(signature_metadata),
            ..UnifiedChunk::default()
        })
    }
}

impl ChunkDecoder for GoogleDecoder {
    fn decode(&mut self, event: &Value) -> Result<Vec<UnifiedChunk>, InferenceError> {
        if self.finished {
            return Ok(Vec::new());
        }
        if let Some(error) = vendor_error_event("Google", event) {
            return Err(error);
        }

        if let Some(usage) = event.get("usageMetadata") {
            let output = u64_field(usage, "candidatesTokenCount")
                .map(|tokens| tokens + u64_field(usage, "thoughtsTokenCount").unwrap_or(0));
            let previous = self.usage.unwrap_or_default();
            self.usage = Some(ChunkUsage {
                input_tokens: u64_field(usage, "promptTokenCount").or(previous.input_tokens),
                output_tokens: output.or(previous.output_tokens),
            });
        }

        let mut chunks = Vec::new();
        let candidate = event
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first());

        let Some(candidate) = candidate else {
            let blocked = event
                .get("promptFeedback")
                .and_then(|feedback| str_field(feedback, "blockReason"));
            if blocked.is_some() {
                self.finished = true;
                chunks.push(UnifiedChunk::terminal(
                    FinishReason::ContentFilter,
                    self.usage,
                ));
            }
            return Ok(chunks);
        };

        if let Some(parts) = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        {
            chunks.extend(
                parts
                    .iter()
                    .filter_map(|part| self.decode_part(part))
                    .filter(UnifiedChunk::should_emit),
            );
        }

        if let Some(reason) = str_field(candidate, "finishReason") {
            self.finished = true;
            let reason = match map_finish_reason(reason) {
                FinishReason::Stop if self.next_tool_index > 0 => FinishReason::ToolCalls,
                other => other,
            };
            chunks.push(UnifiedChunk::terminal(reason, self.usage));
        }

        Ok(chunks)
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "IMAGE_SAFETY" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_ascii_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::ChunkAccumulator;
    use crate::image::test_support::StaticImageFetcher;

    fn decode_all(events: &[Value]) -> Vec<UnifiedChunk> {
        let mut decoder = GoogleDecoder::new();
        events
            .iter()
            .flat_map(|event| decoder.decode(event).expect("decodes"))
            .collect()
    }

    #[tokio::test]
    async fn function_responses_merge_into_following_user_turn() {
        let request = ConversionRequest::new(
            "gemini-2.5-flash",
            vec![
                Message::user_text("weather in Oslo and Rome"),
                Message::Assistant {
                    content: vec![
                        ContentPart::ToolUse {
                            id: "c1".to_string(),
                            name: "weather".to_string(),
                            params: json!({ "city": "Oslo" }),
                            provider_metadata: Some(json!({ "thoughtSignature": "sig-a" })),
                        },
                        ContentPart::tool_use("c2", "weather", json!({ "city": "Rome" })),
                    ],
                },
                Message::ToolResult {
                    content: vec![ContentPart::tool_result("c1", "weather", "rain")],
                },
                Message::ToolResult {
                    content: vec![ContentPart::ToolResult {
                        tool_use_id: "c2".to_string(),
                        tool_name: "weather".to_string(),
                        output: "timeout".to_string(),
                        is_error: true,
                    }],
                },
                Message::user_text("which is warmer?"),
            ],
        )
        .with_system_prompt("sys");

        let payload = GoogleConverter::default()
            .convert(&request, None)
            .await
            .expect("converts");

        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], json!("sys"));
        let contents = payload["contents"].as_array().expect("contents");
        let roles = contents
            .iter()
            .map(|content| content["role"].as_str().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(contents[1]["parts"][0]["thoughtSignature"], json!("sig-a"));
        assert!(contents[1]["parts"][1].get("thoughtSignature").is_none());

        let last = contents[2]["parts"].as_array().expect("parts");
        assert_eq!(last.len(), 3);
        assert_eq!(
            last[0]["functionResponse"]["response"],
            json!({ "output": "rain" })
        );
        assert_eq!(
            last[1]["functionResponse"]["response"],
            json!({ "error": "timeout" })
        );
        assert_eq!(last[2], json!({ "text": "which is warmer?" }));
    }

    #[tokio::test]
    async fn tool_config_images_and_thinking() {
        let fetcher = StaticImageFetcher::with_image("s3://x.jpg", "image/jpeg", b"jpg");
        let request = ConversionRequest::new(
            "gemini-2.5-pro",
            vec![Message::User {
                content: vec![ContentPart::image("s3://x.jpg", "image/jpeg")],
            }],
        )
        .with_tools(
            vec![Tool {
                name: "describe".to_string(),
                description: "Describe".to_string(),
                parameters: json!({ "type": "object" }),
            }],
            ToolChoice::Named("describe".to_string()),
        );

        let payload = GoogleConverter {
            max_tokens: Some(1000),
            thinking_budget: 512,
        }
        .convert(&request, Some(&fetcher))
        .await
        .expect("converts");

        assert_eq!(
            payload["contents"][0]["parts"][0]["inlineData"],
            json!({ "mimeType": "image/jpeg", "data": "anBn" })
        );
        assert_eq!(
            payload["toolConfig"]["functionCallingConfig"],
            json!({ "mode": "ANY", "allowedFunctionNames": ["describe"] })
        );
        assert_eq!(
            payload["tools"][0]["functionDeclarations"][0]["name"],
            json!("describe")
        );
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], json!(1000));
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            json!(512)
        );
    }

    #[test]
    fn thought_signature_stays_on_its_own_part() {
        let chunks = decode_all(&[
            json!({ "candidates": [{ "content": { "role": "model", "parts": [
                { "text": "pondering", "thought": true, "thoughtSignature": "sig-think" }
            ] } }] }),
            json!({ "candidates": [{ "content": { "role": "model", "parts": [
                { "text": "Answer", "thoughtSignature": "sig-text" },
                { "text": " more" }
            ] } }] }),
        ]);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].thinking_delta.as_deref(), Some("pondering"));
        assert_eq!(chunks[0].thinking_signature.as_deref(), Some("sig-think"));
        assert_eq!(chunks[1].text_delta.as_deref(), Some("Answer"));
        assert_eq!(
            chunks[1].text_provider_metadata,
            Some(json!({ "thoughtSignature": "sig-text" }))
        );
        assert_eq!(chunks[2], UnifiedChunk::text(" more"));
    }

    #[test]
    fn parallel_function_calls_in_one_event_get_distinct_indices() {
        let chunks = decode_all(&[
            json!({ "candidates": [{ "content": { "role": "model", "parts": [
                { "functionCall": { "name": "weather", "args": { "city": "Oslo" } }, "thoughtSignature": "sig-1" },
                { "functionCall": { "name": "weather", "args": { "city": "Rome" } } }
            ] }, "finishReason": "STOP" }],
              "usageMetadata": { "promptTokenCount": 20, "candidatesTokenCount": 8, "thoughtsTokenCount": 4 } }),
        ]);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks[0].tool_call_deltas[0].provider_metadata,
            Some(json!({ "thoughtSignature": "sig-1" }))
        );
        assert_eq!(chunks[1].tool_call_deltas[0].provider_metadata, None);

        let mut accumulator = ChunkAccumulator::new();
        for chunk in &chunks {
            accumulator.push(chunk);
        }
        let turn = accumulator.finish();
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].index, 0);
        assert_eq!(turn.tool_calls[0].id, "call_0");
        assert_eq!(turn.tool_calls[0].arguments, json!({ "city": "Oslo" }));
        assert_eq!(turn.tool_calls[1].index, 1);
        assert_eq!(turn.tool_calls[1].arguments, json!({ "city": "Rome" }));
        assert_eq!(turn.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(turn.usage.input_tokens, Some(20));
        assert_eq!(turn.usage.output_tokens, Some(12));
    }

    #[test]
    fn blocked_prompt_ends_with_content_filter() {
        let chunks = decode_all(&[
            json!({ "promptFeedback": { "blockReason": "SAFETY" } }),
            json!({ "candidates": [{ "content": { "parts": [{ "text": "late" }] } }] }),
        ]);
        assert_eq!(
            chunks,
            vec![UnifiedChunk::terminal(FinishReason::ContentFilter, None)]
        );
    }

    #[test]
    fn input_and_output_counts_from_different_events_both_survive() {
        let chunks = decode_all(&[
            json!({ "usageMetadata": { "promptTokenCount": 5 } }),
            json!({ "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }] }),
            json!({ "candidates": [{ "finishReason": "STOP" }],
              "usageMetadata": { "candidatesTokenCount": 3 } }),
        ]);
        let terminal = chunks.last().expect("terminal chunk");
        assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
        assert_eq!(
            terminal.usage,
            Some(ChunkUsage {
                input_tokens: Some(5),
                output_tokens: Some(3),
            })
        );
    }

    #[test]
    fn usage_only_events_emit_nothing_until_the_end() {
        let chunks = decode_all(&[
            json!({ "candidates": [{ "content": { "parts": [{ "text": "" }] } }], "usageMetadata": { "promptTokenCount": 3 } }),
            json!({ "candidates": [{ "content": { "parts": [{ "text": "ok" }] }, "finishReason": "MAX_TOKENS" }],
              "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 1 } }),
        ]);
        assert_eq!(
            chunks,
            vec![
                UnifiedChunk::text("ok"),
                UnifiedChunk::terminal(
                    FinishReason::Length,
                    Some(ChunkUsage {
                        input_tokens: Some(3),
                        output_tokens: Some(1),
                    })
                ),
            ]
        );
    }
}
