//! Per-vendor converters and decoders. Each vendor is a composition of a
//! [`MessageConverter`], a [`DecoderFactory`] and a dispatcher; nothing is
//! shared between vendors except the helpers in this module.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::chunk::UnifiedChunk;
use crate::error::InferenceError;
use crate::image::ImageFetchService;
use crate::types::ConversionRequest;

pub mod anthropic;
pub mod google;
pub mod openai_chat;
pub mod openai_responses;
pub mod stub;

/// Tool results that carry no text still need a body on every wire format.
pub(crate) const EMPTY_TOOL_RESULT_TEXT: &str = "(no text result)";

#[async_trait]
pub trait MessageConverter: Send + Sync {
    /// Builds the vendor request body. Image parts are fetched through
    /// `images`; any rejected attachment fails the whole conversion.
    async fn convert(
        &self,
        request: &ConversionRequest,
        images: Option<&dyn ImageFetchService>,
    ) -> Result<Value, InferenceError>;
}

pub type MessageConverterRef = Arc<dyn MessageConverter>;

/// Stateful translator from vendor events to unified chunks. One instance
/// serves exactly one live stream.
///
/// Irrelevant events decode to nothing. An in-band vendor error event is an
/// `Err`, which ends the stream.
pub trait ChunkDecoder: Send {
    fn decode(&mut self, event: &Value) -> Result<Vec<UnifiedChunk>, InferenceError>;

    /// Chunks still held when the vendor sequence ends.
    fn finish(&mut self) -> Vec<UnifiedChunk> {
        Vec::new()
    }
}

pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn ChunkDecoder> + Send + Sync>;

pub(crate) fn decoder_factory<D, F>(make: F) -> DecoderFactory
where
    D: ChunkDecoder + 'static,
    F: Fn() -> D + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn ChunkDecoder>)
}

/// A vendor turn before it is rendered into the vendor's message shape.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireTurn {
    pub role: &'static str,
    pub parts: Vec<Value>,
}

impl WireTurn {
    pub(crate) fn new(role: &'static str, parts: Vec<Value>) -> Self {
        Self { role, parts }
    }
}

/// Folds turns for vendors that require strict role alternation.
///
/// Empty turns are dropped. A turn whose role equals the previous turn's
/// role is appended to it, unless that role is the assistant role.
pub(crate) fn merge_alternating_turns(
    turns: impl IntoIterator<Item = WireTurn>,
    assistant_role: &str,
) -> Vec<WireTurn> {
    let mut merged: Vec<WireTurn> = Vec::new();
    for turn in turns {
        if turn.parts.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some(last) if last.role == turn.role && turn.role != assistant_role => {
                last.parts.extend(turn.parts);
            }
            _ => merged.push(turn),
        }
    }
    merged
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub(crate) fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

/// `{"error": {"message": ...}}` or `{"type": "error", ...}` inside a stream.
pub(crate) fn vendor_error_event(label: &str, event: &Value) -> Option<InferenceError> {
    let error = event.get("error").filter(|error| !error.is_null())?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown error");
    Some(
        InferenceError::interrupted(format!("{label} stream error: {message}"))
            .with_details(error.clone()),
    )
}

pub(crate) fn non_empty_text(text: &str) -> &str {
    if text.is_empty() {
        EMPTY_TOOL_RESULT_TEXT
    } else {
        text
    }
}
