use std::collections::HashMap;

use serde_json::{json, Value};

use super::REDACTED_THINKING_DATA;
use crate::chunk::{ChunkUsage, FinishReason, ToolCallDelta, UnifiedChunk};
use crate::error::InferenceError;
use crate::providers::{str_field, u64_field, vendor_error_event, ChunkDecoder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    Text,
    Thinking,
    ToolCall { tool_index: usize },
}

/// Content blocks are addressed by Anthropic's block index, which counts
/// text and thinking blocks too; tool calls get their own dense counter.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    blocks: HashMap<usize, BlockState>,
    next_tool_index: usize,
    finished: bool,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn block_start(&mut self, event: &Value) -> Option<UnifiedChunk> {
        let block_index = u64_field(event, "index")? as usize;
        let block = event.get("content_block")?;
        match str_field(block, "type")? {
            "text" => {
                self.blocks.insert(block_index, BlockState::Text);
                str_field(block, "text")
                    .filter(|text| !text.is_empty())
                    .map(UnifiedChunk::text)
            }
            "thinking" => {
                self.blocks.insert(block_index, BlockState::Thinking);
                str_field(block, "thinking")
                    .filter(|text| !text.is_empty())
                    .map(UnifiedChunk::thinking)
            }
            "redacted_thinking" => {
                let data = str_field(block, "data").filter(|data| !data.is_empty())?;
                Some(UnifiedChunk {
                    thinking_provider_metadata: Some(json!({ REDACTED_THINKING_DATA: data })),
                    ..UnifiedChunk::default()
                })
            }
            "tool_use" => {
                let tool_index = self.next_tool_index;
                self.next_tool_index += 1;
                self.blocks
                    .insert(block_index, BlockState::ToolCall { tool_index });
                Some(UnifiedChunk::tool_calls(vec![ToolCallDelta::start(
                    tool_index,
                    str_field(block, "id").unwrap_or_default(),
                    str_field(block, "name").unwrap_or_default(),
                )]))
            }
            _ => None,
        }
    }

    fn block_delta(&self, event: &Value) -> Option<UnifiedChunk> {
        let block_index = u64_field(event, "index")? as usize;
        let delta = event.get("delta")?;
        let state = self.blocks.get(&block_index)?;

        match (state, str_field(delta, "type")?) {
            (BlockState::Text, "text_delta") => str_field(delta, "text")
                .filter(|text| !text.is_empty())
                .map(UnifiedChunk::text),
            (BlockState::Thinking, "thinking_delta") => str_field(delta, "thinking")
                .filter(|text| !text.is_empty())
                .map(UnifiedChunk::thinking),
            (BlockState::Thinking, "signature_delta") => {
                let signature = str_field(delta, "signature").filter(|s| !s.is_empty())?;
                Some(UnifiedChunk {
                    thinking_signature: Some(signature.to_string()),
                    ..UnifiedChunk::default()
                })
            }
            (BlockState::ToolCall { tool_index }, "input_json_delta") => {
                let fragment = str_field(delta, "partial_json").filter(|s| !s.is_empty())?;
                Some(UnifiedChunk::tool_calls(vec![ToolCallDelta::arguments(
                    *tool_index,
                    fragment,
                )]))
            }
            _ => None,
        }
    }
}

impl ChunkDecoder for AnthropicDecoder {
    fn decode(&mut self, event: &Value) -> Result<Vec<UnifiedChunk>, InferenceError> {
        if self.finished {
            return Ok(Vec::new());
        }

        let chunk = match str_field(event, "type").unwrap_or_default() {
            "error" => {
                return Err(vendor_error_event("Anthropic", event).unwrap_or_else(|| {
                    InferenceError::interrupted("Anthropic stream error without details")
                }))
            }
            "message_start" => event
                .get("message")
                .and_then(|message| message.get("usage"))
                .and_then(|usage| u64_field(usage, "input_tokens"))
                .map(|tokens| UnifiedChunk::usage(ChunkUsage::input(tokens))),
            "content_block_start" => self.block_start(event),
            "content_block_delta" => self.block_delta(event),
            "content_block_stop" => {
                if let Some(index) = u64_field(event, "index") {
                    self.blocks.remove(&(index as usize));
                }
                None
            }
            "message_delta" => {
                let usage = event
                    .get("usage")
                    .and_then(|usage| u64_field(usage, "output_tokens"))
                    .map(ChunkUsage::output);
                match event
                    .get("delta")
                    .and_then(|delta| str_field(delta, "stop_reason"))
                {
                    Some(reason) => {
                        self.finished = true;
                        Some(UnifiedChunk::terminal(map_stop_reason(reason), usage))
                    }
                    None => usage.map(UnifiedChunk::usage),
                }
            }
            _ => None,
        };

        Ok(chunk.into_iter().collect())
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::ChunkAccumulator;
    use crate::error::InferenceErrorCode;
    use serde_json::json;

    fn run(events: Vec<Value>) -> Vec<UnifiedChunk> {
        let mut decoder = AnthropicDecoder::new();
        events
            .iter()
            .flat_map(|event| decoder.decode(event).expect("decodes"))
            .collect()
    }

    #[test]
    fn decodes_thinking_text_and_parallel_tool_calls() {
        let chunks = run(vec![
            json!({ "type": "message_start", "message": { "usage": { "input_tokens": 42, "output_tokens": 1 } } }),
            json!({ "type": "content_block_start", "index": 0, "content_block": { "type": "thinking", "thinking": "" } }),
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "thinking_delta", "thinking": "Let me " } }),
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "thinking_delta", "thinking": "check." } }),
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "signature_delta", "signature": "EqQB" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
            json!({ "type": "ping" }),
            json!({ "type": "content_block_start", "index": 1, "content_block": { "type": "text", "text": "" } }),
            json!({ "type": "content_block_delta", "index": 1, "delta": { "type": "text_delta", "text": "Checking both." } }),
            json!({ "type": "content_block_stop", "index": 1 }),
            json!({ "type": "content_block_start", "index": 2, "content_block": { "type": "tool_use", "id": "toolu_a", "name": "weather", "input": {} } }),
            json!({ "type": "content_block_delta", "index": 2, "delta": { "type": "input_json_delta", "partial_json": "{\"city\":" } }),
            json!({ "type": "content_block_start", "index": 3, "content_block": { "type": "tool_use", "id": "toolu_b", "name": "time", "input": {} } }),
            json!({ "type": "content_block_delta", "index": 3, "delta": { "type": "input_json_delta", "partial_json": "{}" } }),
            json!({ "type": "content_block_delta", "index": 2, "delta": { "type": "input_json_delta", "partial_json": "\"Oslo\"}" } }),
            json!({ "type": "content_block_stop", "index": 2 }),
            json!({ "type": "content_block_stop", "index": 3 }),
            json!({ "type": "message_delta", "delta": { "stop_reason": "tool_use" }, "usage": { "output_tokens": 77 } }),
            json!({ "type": "message_stop" }),
        ]);

        assert_eq!(chunks[0], UnifiedChunk::usage(ChunkUsage::input(42)));
        assert_eq!(chunks[3].thinking_signature.as_deref(), Some("EqQB"));
        assert!(chunks.iter().all(UnifiedChunk::should_emit));

        let mut accumulator = ChunkAccumulator::new();
        for chunk in &chunks {
            accumulator.push(chunk);
        }
        let turn = accumulator.finish();
        assert_eq!(turn.thinking, "Let me check.");
        assert_eq!(turn.thinking_signature.as_deref(), Some("EqQB"));
        assert_eq!(turn.text, "Checking both.");
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].index, 0);
        assert_eq!(turn.tool_calls[0].id, "toolu_a");
        assert_eq!(turn.tool_calls[0].arguments, json!({ "city": "Oslo" }));
        assert_eq!(turn.tool_calls[1].index, 1);
        assert_eq!(turn.tool_calls[1].arguments, json!({}));
        assert_eq!(turn.usage.input_tokens, Some(42));
        assert_eq!(turn.usage.output_tokens, Some(77));
        assert_eq!(turn.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn redacted_thinking_data_becomes_its_own_thinking_part() {
        let chunks = run(vec![
            json!({ "type": "content_block_start", "index": 0, "content_block": { "type": "thinking", "thinking": "" } }),
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "thinking_delta", "thinking": "visible" } }),
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "signature_delta", "signature": "sig-a" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
            json!({ "type": "content_block_start", "index": 1, "content_block": { "type": "redacted_thinking", "data": "EmwKAhgB" } }),
            json!({ "type": "content_block_stop", "index": 1 }),
            json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" } }),
        ]);
        assert_eq!(
            chunks[2].thinking_provider_metadata,
            Some(json!({ "redactedData": "EmwKAhgB" }))
        );

        let mut accumulator = ChunkAccumulator::new();
        for chunk in &chunks {
            accumulator.push(chunk);
        }
        let turn = accumulator.finish();
        assert_eq!(turn.content.len(), 2);
        assert_eq!(
            turn.content[1],
            crate::types::ContentPart::Thinking {
                text: String::new(),
                id: None,
                signature: None,
                provider_metadata: Some(json!({ "redactedData": "EmwKAhgB" })),
            }
        );
    }

    #[test]
    fn terminal_chunk_ends_decoding() {
        let mut decoder = AnthropicDecoder::new();
        let terminal = decoder
            .decode(&json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" }, "usage": { "output_tokens": 3 } }))
            .expect("decodes");
        assert_eq!(
            terminal,
            vec![UnifiedChunk::terminal(
                FinishReason::Stop,
                Some(ChunkUsage::output(3))
            )]
        );
        assert!(decoder
            .decode(&json!({ "type": "content_block_start", "index": 9, "content_block": { "type": "text", "text": "late" } }))
            .expect("decodes")
            .is_empty());
    }

    #[test]
    fn deltas_for_unknown_blocks_and_unknown_events_produce_nothing() {
        let chunks = run(vec![
            json!({ "type": "content_block_delta", "index": 5, "delta": { "type": "text_delta", "text": "orphan" } }),
            json!({ "type": "something_new" }),
        ]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn error_event_interrupts_stream() {
        let error = AnthropicDecoder::new()
            .decode(&json!({ "type": "error", "error": { "type": "overloaded_error", "message": "Overloaded" } }))
            .expect_err("error event");
        assert_eq!(error.code, InferenceErrorCode::StreamInterrupted);
        assert!(error.message.contains("Overloaded"));
    }
}
