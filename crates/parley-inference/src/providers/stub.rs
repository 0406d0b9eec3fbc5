//! Offline provider used in test mode. No network: the dispatcher hands the
//! converted payload straight back as the only event.

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Value};

use super::{str_field, ChunkDecoder, MessageConverter};
use crate::chunk::{FinishReason, UnifiedChunk};
use crate::dispatch::{Dispatcher, RawEventStream};
use crate::error::InferenceError;
use crate::image::ImageFetchService;
use crate::types::ConversionRequest;

const NAME_CHAT_PREFIX: &str = "name this chat";

#[derive(Debug, Clone, Copy, Default)]
pub struct StubConverter;

#[async_trait]
impl MessageConverter for StubConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
        _images: Option<&dyn ImageFetchService>,
    ) -> Result<Value, InferenceError> {
        Ok(json!({
            "model": request.model,
            "lastUserText": request.last_user_text().unwrap_or_default(),
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StubDispatcher;

#[async_trait]
impl Dispatcher for StubDispatcher {
    async fn issue(&self, payload: Value) -> Result<RawEventStream, InferenceError> {
        Ok(Box::pin(stream::iter([Ok(payload)])))
    }
}

#[derive(Debug, Default)]
pub struct StubDecoder {
    finished: bool,
}

impl StubDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkDecoder for StubDecoder {
    fn decode(&mut self, event: &Value) -> Result<Vec<UnifiedChunk>, InferenceError> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        let model = str_field(event, "model").unwrap_or("unknown");
        let last_user_text = str_field(event, "lastUserText").unwrap_or_default();
        Ok(vec![
            UnifiedChunk::text(synthetic_reply(model, last_user_text)),
            UnifiedChunk::terminal(FinishReason::Stop, None),
        ])
    }
}

fn synthetic_reply(model: &str, last_user_text: &str) -> String {
    let mut reply = format!("[test mode] Response from {model}.");
    if let Some(name) = requested_chat_name(last_user_text) {
        reply.push_str(&format!(" Chat name: {name}"));
    }
    reply
}

/// Extracts `X` from `"Name this chat X"`, case-insensitively. Surrounding
/// quotes and trailing punctuation are stripped.
fn requested_chat_name(text: &str) -> Option<&str> {
    let text = text.trim();
    let head = text.get(..NAME_CHAT_PREFIX.len())?;
    if !head.eq_ignore_ascii_case(NAME_CHAT_PREFIX) {
        return None;
    }
    let rest = &text[NAME_CHAT_PREFIX.len()..];
    if !rest.starts_with(char::is_whitespace) && !rest.starts_with(':') {
        return None;
    }
    let name = rest
        .trim_start_matches(|c: char| c.is_whitespace() || c == ':')
        .trim_end_matches(['.', '!', '?'])
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    Some(name).filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use futures_util::StreamExt;

    async fn run(model: &str, text: &str) -> Vec<UnifiedChunk> {
        let request = ConversionRequest::new(model, vec![Message::user_text(text)]);
        let payload = StubConverter.convert(&request, None).await.expect("converts");
        let mut events = StubDispatcher.issue(payload).await.expect("issues");
        let mut decoder = StubDecoder::new();
        let mut chunks = Vec::new();
        while let Some(event) = events.next().await {
            chunks.extend(decoder.decode(&event.expect("event")).expect("decodes"));
        }
        chunks
    }

    #[tokio::test]
    async fn identical_requests_produce_identical_output() {
        let first = run("gpt-4o", "hello").await;
        let second = run("gpt-4o", "hello").await;
        assert_eq!(first, second);
        assert_eq!(
            first[0].text_delta.as_deref(),
            Some("[test mode] Response from gpt-4o.")
        );
        assert_eq!(first[1].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn chat_name_request_is_echoed() {
        let chunks = run("claude", "Name this chat Foo").await;
        let text = chunks[0].text_delta.as_deref().unwrap_or_default();
        assert!(text.contains("claude"));
        assert!(text.ends_with("Chat name: Foo"));
    }

    #[test]
    fn chat_name_parsing() {
        assert_eq!(requested_chat_name("name this chat \"Trip plans\"."), Some("Trip plans"));
        assert_eq!(requested_chat_name("Name this chat: Bar"), Some("Bar"));
        assert_eq!(requested_chat_name("Name this chatter Bar"), None);
        assert_eq!(requested_chat_name("Name this chat"), None);
        assert_eq!(requested_chat_name("Please name this chat Foo"), None);
        assert_eq!(requested_chat_name("héllo"), None);
    }
}
