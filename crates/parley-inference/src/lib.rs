//! Provider-agnostic streaming inference: one request shape in, one chunk
//! protocol out, whichever vendor answers.

mod accumulator;
mod chunk;
mod config;
mod dispatch;
mod error;
mod image;
pub mod providers;
mod registry;
mod service;
mod sse;
mod tag_parser;
mod types;
mod validation;

pub use accumulator::{AccumulatedTurn, ChunkAccumulator, ReconstructedToolCall};
pub use chunk::{ChunkUsage, FinishReason, ToolCallDelta, UnifiedChunk};
pub use config::{
    load_inference_config, parse_inference_config, test_mode_from_env, ConfigError,
    InferenceConfig, ProviderConfig, ProviderKind, TEST_MODE_ENV,
};
pub use dispatch::{
    Connector, Dispatcher, DispatcherRef, HttpSseConnector, RawEventStream, RetryPolicy,
    RetryingDispatcher, Route, DEFAULT_RETRY_DELAY, DEFAULT_TRANSPORT_RETRY_COUNT,
};
pub use error::{InferenceError, InferenceErrorCode};
pub use image::{
    FetchedImage, HttpImageFetcher, ImageFetchError, ImageFetchService, ImageFetchServiceRef,
    MAX_IMAGE_BYTES, SUPPORTED_IMAGE_TYPES,
};
pub use providers::{ChunkDecoder, DecoderFactory, MessageConverter, MessageConverterRef};
pub use registry::{ProviderRegistry, ResolvedProvider};
pub use service::{ChunkStream, InferenceService};
pub use sse::{SseFrame, SseFramer};
pub use tag_parser::{ParsedDelta, TagParser, TagState, DEFAULT_THINK_END, DEFAULT_THINK_START};
pub use types::{
    ConversionRequest, ContentPart, FetchContext, ImageReference, Message, ProviderMetadata, Role,
    Tool, ToolChoice,
};
pub use validation::{validate_tool_call, ToolCallError, ToolCallErrorCode, ToolCallValidator};
