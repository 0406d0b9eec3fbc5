//! Anthropic Messages API: strict role alternation, extended thinking with
//! signatures, tool calls streamed as `input_json_delta` fragments.

mod decoder;
mod payload;

pub use decoder::AnthropicDecoder;
pub use payload::AnthropicConverter;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Key under which a `redacted_thinking` block's opaque `data` travels in
/// thinking provider metadata.
pub const REDACTED_THINKING_DATA: &str = "redactedData";
