use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use tracing::{info, warn};

use crate::accumulator::{AccumulatedTurn, ChunkAccumulator};
use crate::chunk::UnifiedChunk;
use crate::error::InferenceError;
use crate::image::ImageFetchServiceRef;
use crate::registry::ProviderRegistry;
use crate::tag_parser::{ParsedDelta, TagParser};
use crate::types::ConversionRequest;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<UnifiedChunk, InferenceError>> + Send>>;

/// Entry point for callers: resolve, convert, dispatch, then decode the live
/// event sequence into unified chunks.
///
/// The returned stream ends right after the terminal chunk, or with a single
/// `Err`. Dropping it closes the vendor connection.
#[derive(Clone)]
pub struct InferenceService {
    registry: Arc<ProviderRegistry>,
    images: Option<ImageFetchServiceRef>,
}

impl InferenceService {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            images: None,
        }
    }

    pub fn with_image_fetcher(mut self, images: ImageFetchServiceRef) -> Self {
        self.images = Some(images);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub async fn answer(
        &self,
        provider_id: &str,
        request: ConversionRequest,
    ) -> Result<ChunkStream, InferenceError> {
        let provider = self.registry.resolve(provider_id)?;
        let payload = provider
            .converter
            .convert(&request, self.images.as_deref())
            .await?;
        let mut events = provider.dispatcher.issue(payload).await?;

        let provider_id = provider_id.to_string();
        let model = request.model;
        info!(provider = %provider_id, model = %model, "inference stream opened");

        let mut decoder = (provider.decoder_factory)();
        let mut tags = provider.inline_reasoning_tags.then(TagParser::default);

        Ok(Box::pin(stream! {
            let mut emitted = 0usize;
            let mut finish_reason = None;

            while let Some(event) = events.next().await {
                let decoded = match event.and_then(|event| decoder.decode(&event)) {
                    Ok(chunks) => chunks,
                    Err(error) => {
                        warn!(provider = %provider_id, error = %error, "inference stream failed");
                        yield Err(error);
                        return;
                    }
                };
                for chunk in shape_chunks(tags.as_mut(), decoded) {
                    emitted += 1;
                    finish_reason = chunk.finish_reason.clone();
                    yield Ok(chunk);
                }
                if finish_reason.is_some() {
                    break;
                }
            }

            if finish_reason.is_none() {
                for chunk in shape_chunks(tags.as_mut(), decoder.finish()) {
                    emitted += 1;
                    finish_reason = chunk.finish_reason.clone();
                    yield Ok(chunk);
                }
            }

            match finish_reason {
                Some(reason) => info!(
                    provider = %provider_id,
                    model = %model,
                    chunks = emitted,
                    finish_reason = reason.as_str(),
                    "inference stream closed"
                ),
                None => {
                    warn!(provider = %provider_id, model = %model, "stream ended without a finish reason");
                    yield Err(InferenceError::interrupted(
                        "Stream ended without a finish reason",
                    ));
                }
            }
        }))
    }

    /// Drains `answer` into one accumulated turn.
    pub async fn complete(
        &self,
        provider_id: &str,
        request: ConversionRequest,
    ) -> Result<AccumulatedTurn, InferenceError> {
        let stream = self.answer(provider_id, request).await?;
        ChunkAccumulator::accumulate_stream(stream).await
    }
}

/// Splits inline reasoning out of text deltas, drops empty chunks, and cuts
/// the batch after the terminal chunk. The parser is flushed into the
/// terminal chunk.
fn shape_chunks(
    mut parser: Option<&mut TagParser>,
    chunks: Vec<UnifiedChunk>,
) -> Vec<UnifiedChunk> {
    let mut shaped = Vec::with_capacity(chunks.len());
    for mut chunk in chunks {
        if let Some(parser) = parser.as_deref_mut() {
            if let Some(text) = chunk.text_delta.take() {
                let parsed = parser.parse(&text);
                merge_parsed(&mut chunk, parsed);
            }
            if chunk.is_terminal() {
                let tail = parser.finish();
                merge_parsed(&mut chunk, tail);
            }
        }

        let terminal = chunk.is_terminal();
        if chunk.should_emit() {
            shaped.push(chunk);
        }
        if terminal {
            break;
        }
    }
    shaped
}

fn merge_parsed(chunk: &mut UnifiedChunk, parsed: ParsedDelta) {
    append(&mut chunk.thinking_delta, parsed.thinking_delta);
    append(&mut chunk.text_delta, parsed.text_content_delta);
}

fn append(target: &mut Option<String>, addition: Option<String>) {
    match (target.as_mut(), addition) {
        (Some(existing), Some(addition)) => existing.push_str(&addition),
        (None, Some(addition)) => *target = Some(addition),
        (_, None) => {}
    }
}
