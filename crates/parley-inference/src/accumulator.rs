//! Folds a unified chunk sequence back into a complete assistant turn.

use std::collections::BTreeMap;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunk::{ChunkUsage, FinishReason, UnifiedChunk};
use crate::types::{ContentPart, Message, ProviderMetadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    /// Concatenated `argumentsDelta` fragments, exactly as received.
    #[serde(rename = "rawArguments")]
    pub raw_arguments: String,
    /// Parsed arguments; `{}` when nothing arrived, `null` when unparseable.
    pub arguments: Value,
    #[serde(
        rename = "providerMetadata",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub provider_metadata: Option<ProviderMetadata>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccumulatedTurn {
    pub text: String,
    pub thinking: String,
    /// Signature of the last thinking block.
    #[serde(rename = "thinkingSignature", skip_serializing_if = "Option::is_none")]
    pub thinking_signature: Option<String>,
    /// Thinking and text spans in arrival order, each with its own
    /// continuity fields.
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(rename = "toolCalls")]
    pub tool_calls: Vec<ReconstructedToolCall>,
    pub usage: ChunkUsage,
    #[serde(rename = "finishReason", skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl AccumulatedTurn {
    /// The assistant message to send back on the next request, with every
    /// continuity token in place.
    pub fn to_message(&self) -> Message {
        let mut content = self.content.clone();
        content.extend(self.tool_calls.iter().map(|call| ContentPart::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            params: match &call.arguments {
                Value::Null => Value::Object(Map::new()),
                arguments => arguments.clone(),
            },
            provider_metadata: call.provider_metadata.clone(),
        }));
        Message::Assistant { content }
    }
}

/// A thinking span closes once it has received an id, a signature or other
/// continuity data; the next thinking delta opens a new one.
#[derive(Debug)]
struct Segment {
    part: ContentPart,
    sealed: bool,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    provider_metadata: Option<ProviderMetadata>,
}

/// Sparse-index aware: a call at index 3 may arrive before index 0.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    text: String,
    thinking: String,
    thinking_signature: Option<String>,
    segments: Vec<Segment>,
    tool_calls: BTreeMap<usize, PendingToolCall>,
    usage: ChunkUsage,
    finish_reason: Option<FinishReason>,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &UnifiedChunk) {
        self.push_thinking(chunk);
        self.push_text(chunk);

        for delta in &chunk.tool_call_deltas {
            let call = self.tool_calls.entry(delta.index).or_default();
            if let Some(id) = &delta.id {
                call.id = id.clone();
            }
            if let Some(name) = &delta.name {
                call.name = name.clone();
            }
            if let Some(arguments) = &delta.arguments_delta {
                call.arguments.push_str(arguments);
            }
            if delta.provider_metadata.is_some() {
                call.provider_metadata = delta.provider_metadata.clone();
            }
        }

        if let Some(usage) = chunk.usage {
            if usage.input_tokens.is_some() {
                self.usage.input_tokens = usage.input_tokens;
            }
            if usage.output_tokens.is_some() {
                self.usage.output_tokens = usage.output_tokens;
            }
        }
        if let Some(reason) = &chunk.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
    }

    fn push_thinking(&mut self, chunk: &UnifiedChunk) {
        let delta = chunk.thinking_delta.as_deref().filter(|delta| !delta.is_empty());
        let continuity = chunk.thinking_id.is_some()
            || chunk.thinking_signature.is_some()
            || chunk.thinking_provider_metadata.is_some();
        if delta.is_none() && !continuity {
            return;
        }

        let open = matches!(
            self.segments.last(),
            Some(Segment { part: ContentPart::Thinking { .. }, sealed: false })
        );
        if !open {
            self.segments.push(Segment {
                part: ContentPart::thinking("", None),
                sealed: false,
            });
        }
        let Some(segment) = self.segments.last_mut() else {
            return;
        };
        let ContentPart::Thinking {
            text,
            id,
            signature,
            provider_metadata,
        } = &mut segment.part
        else {
            return;
        };

        if let Some(delta) = delta {
            self.thinking.push_str(delta);
            text.push_str(delta);
        }
        if let Some(thinking_id) = &chunk.thinking_id {
            *id = Some(thinking_id.clone());
        }
        if let Some(thinking_signature) = &chunk.thinking_signature {
            *signature = Some(thinking_signature.clone());
            self.thinking_signature = Some(thinking_signature.clone());
        }
        if let Some(metadata) = &chunk.thinking_provider_metadata {
            *provider_metadata = Some(metadata.clone());
        }
        segment.sealed = continuity;
    }

    fn push_text(&mut self, chunk: &UnifiedChunk) {
        let delta = chunk.text_delta.as_deref().filter(|delta| !delta.is_empty());
        let metadata = chunk.text_provider_metadata.as_ref();
        if delta.is_none() && metadata.is_none() {
            return;
        }

        let reusable = match self.segments.last() {
            Some(Segment {
                part: ContentPart::Text { provider_metadata, .. },
                ..
            }) => metadata.is_none() || provider_metadata.is_none(),
            _ => false,
        };
        if !reusable {
            self.segments.push(Segment {
                part: ContentPart::text(""),
                sealed: false,
            });
        }
        if let Some(Segment {
            part: ContentPart::Text {
                text,
                provider_metadata,
            },
            ..
        }) = self.segments.last_mut()
        {
            if let Some(delta) = delta {
                self.text.push_str(delta);
                text.push_str(delta);
            }
            if let Some(metadata) = metadata {
                *provider_metadata = Some(metadata.clone());
            }
        }
    }

    pub fn finish(self) -> AccumulatedTurn {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|(index, call)| ReconstructedToolCall {
                index,
                id: call.id,
                name: call.name,
                arguments: parse_arguments(&call.arguments),
                raw_arguments: call.arguments,
                provider_metadata: call.provider_metadata,
            })
            .collect();

        AccumulatedTurn {
            text: self.text,
            thinking: self.thinking,
            thinking_signature: self.thinking_signature,
            content: self
                .segments
                .into_iter()
                .map(|segment| segment.part)
                .collect(),
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }

    /// Drains a chunk stream, stopping at the first error.
    pub async fn accumulate_stream<S, E>(mut stream: S) -> Result<AccumulatedTurn, E>
    where
        S: Stream<Item = Result<UnifiedChunk, E>> + Unpin,
    {
        let mut accumulator = Self::new();
        while let Some(chunk) = stream.next().await {
            accumulator.push(&chunk?);
        }
        Ok(accumulator.finish())
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ToolCallDelta;
    use serde_json::json;

    #[test]
    fn reconstructs_arguments_split_across_chunks() {
        let mut accumulator = ChunkAccumulator::new();
        accumulator.push(&UnifiedChunk::tool_calls(vec![ToolCallDelta::start(
            0, "call_1", "calc",
        )]));
        accumulator.push(&UnifiedChunk::tool_calls(vec![ToolCallDelta::arguments(
            0, "{\"a\":",
        )]));
        accumulator.push(&UnifiedChunk::tool_calls(vec![ToolCallDelta::arguments(
            0, "1}",
        )]));

        let turn = accumulator.finish();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].raw_arguments, "{\"a\":1}");
        assert_eq!(turn.tool_calls[0].arguments, json!({ "a": 1 }));
    }

    #[test]
    fn interleaved_parallel_calls_stay_separate_and_ordered() {
        let mut accumulator = ChunkAccumulator::new();
        accumulator.push(&UnifiedChunk::tool_calls(vec![
            ToolCallDelta::start(1, "b", "second"),
            ToolCallDelta::start(0, "a", "first"),
        ]));
        accumulator.push(&UnifiedChunk::tool_calls(vec![ToolCallDelta::arguments(
            1, "{\"y\":2}",
        )]));
        accumulator.push(&UnifiedChunk::tool_calls(vec![ToolCallDelta::arguments(
            0, "{\"x\":1}",
        )]));

        let turn = accumulator.finish();
        let names = turn
            .tool_calls
            .iter()
            .map(|call| call.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(turn.tool_calls[1].arguments, json!({ "y": 2 }));
    }

    #[test]
    fn usage_halves_from_different_chunks_are_combined() {
        let mut accumulator = ChunkAccumulator::new();
        accumulator.push(&UnifiedChunk::usage(ChunkUsage::input(12)));
        accumulator.push(&UnifiedChunk::text("hi"));
        accumulator.push(&UnifiedChunk::terminal(
            FinishReason::Stop,
            Some(ChunkUsage::output(3)),
        ));

        let turn = accumulator.finish();
        assert_eq!(turn.usage.input_tokens, Some(12));
        assert_eq!(turn.usage.output_tokens, Some(3));
        assert_eq!(turn.finish_reason, Some(FinishReason::Stop));
        assert_eq!(turn.text, "hi");
    }

    #[test]
    fn continuity_tokens_stay_with_their_own_spans() {
        let mut accumulator = ChunkAccumulator::new();
        accumulator.push(&UnifiedChunk::thinking("first"));
        accumulator.push(&UnifiedChunk {
            thinking_id: Some("rs_1".to_string()),
            thinking_signature: Some("enc-1".to_string()),
            ..UnifiedChunk::default()
        });
        accumulator.push(&UnifiedChunk::thinking("second"));
        accumulator.push(&UnifiedChunk {
            thinking_id: Some("rs_2".to_string()),
            ..UnifiedChunk::default()
        });
        accumulator.push(&UnifiedChunk {
            text_delta: Some("hi".to_string()),
            text_provider_metadata: Some(json!({ "thoughtSignature": "sig" })),
            ..UnifiedChunk::default()
        });
        accumulator.push(&UnifiedChunk::text(" there"));
        accumulator.push(&UnifiedChunk::tool_calls(vec![ToolCallDelta::start(
            0, "call_1", "search",
        )]));

        let turn = accumulator.finish();
        assert_eq!(turn.thinking, "firstsecond");
        assert_eq!(turn.text, "hi there");
        assert_eq!(turn.thinking_signature.as_deref(), Some("enc-1"));
        assert_eq!(
            turn.content,
            vec![
                ContentPart::Thinking {
                    text: "first".to_string(),
                    id: Some("rs_1".to_string()),
                    signature: Some("enc-1".to_string()),
                    provider_metadata: None,
                },
                ContentPart::Thinking {
                    text: "second".to_string(),
                    id: Some("rs_2".to_string()),
                    signature: None,
                    provider_metadata: None,
                },
                ContentPart::Text {
                    text: "hi there".to_string(),
                    provider_metadata: Some(json!({ "thoughtSignature": "sig" })),
                },
            ]
        );

        let serialized = serde_json::to_value(&turn).expect("serialize");
        assert_eq!(serialized["content"][0]["id"], json!("rs_1"));
        assert_eq!(
            serialized["content"][2]["providerMetadata"],
            json!({ "thoughtSignature": "sig" })
        );

        let Message::Assistant { content } = turn.to_message() else {
            panic!("assistant message expected");
        };
        assert_eq!(content.len(), 4);
        assert_eq!(content[3], ContentPart::tool_use("call_1", "search", json!({})));
    }

    #[test]
    fn signed_text_spans_do_not_merge() {
        let mut accumulator = ChunkAccumulator::new();
        for signature in ["a", "b"] {
            accumulator.push(&UnifiedChunk {
                text_delta: Some(signature.to_uppercase()),
                text_provider_metadata: Some(json!({ "thoughtSignature": signature })),
                ..UnifiedChunk::default()
            });
        }
        assert_eq!(accumulator.finish().content.len(), 2);
    }

    #[test]
    fn empty_arguments_parse_to_empty_object_and_garbage_to_null() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{\"a\":"), Value::Null);
    }
}
