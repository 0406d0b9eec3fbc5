//! Unified chunk protocol: the one shape every decoder produces.

use serde::{Deserialize, Serialize};

use crate::types::ProviderMetadata;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    #[serde(untagged)]
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Other(raw) => raw,
        }
    }
}

/// Token counts. Either side may be absent: vendors report input and output
/// counts in different events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChunkUsage {
    #[serde(rename = "inputTokens", skip_serializing_if = "Option::is_none", default)]
    pub input_tokens: Option<u64>,
    #[serde(rename = "outputTokens", skip_serializing_if = "Option::is_none", default)]
    pub output_tokens: Option<u64>,
}

impl ChunkUsage {
    pub fn input(tokens: u64) -> Self {
        Self {
            input_tokens: Some(tokens),
            output_tokens: None,
        }
    }

    pub fn output(tokens: u64) -> Self {
        Self {
            input_tokens: None,
            output_tokens: Some(tokens),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Stable position of the call within the assistant turn.
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "argumentsDelta")]
    pub arguments_delta: Option<String>,
    #[serde(
        rename = "providerMetadata",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub provider_metadata: Option<ProviderMetadata>,
}

impl ToolCallDelta {
    pub fn start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments_delta: None,
            provider_metadata: None,
        }
    }

    pub fn arguments(index: usize, delta: impl Into<String>) -> Self {
        Self {
            index,
            id: None,
            name: None,
            arguments_delta: Some(delta.into()),
            provider_metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UnifiedChunk {
    #[serde(rename = "textDelta", skip_serializing_if = "Option::is_none", default)]
    pub text_delta: Option<String>,
    #[serde(rename = "thinkingDelta", skip_serializing_if = "Option::is_none", default)]
    pub thinking_delta: Option<String>,
    #[serde(rename = "thinkingId", skip_serializing_if = "Option::is_none", default)]
    pub thinking_id: Option<String>,
    #[serde(
        rename = "thinkingSignature",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub thinking_signature: Option<String>,
    /// Opaque thinking continuity that is neither an id nor a signature,
    /// such as Anthropic's redacted thinking data.
    #[serde(
        rename = "thinkingProviderMetadata",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub thinking_provider_metadata: Option<ProviderMetadata>,
    #[serde(rename = "toolCallDeltas", skip_serializing_if = "Vec::is_empty", default)]
    pub tool_call_deltas: Vec<ToolCallDelta>,
    #[serde(rename = "finishReason", skip_serializing_if = "Option::is_none", default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<ChunkUsage>,
    #[serde(
        rename = "textProviderMetadata",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub text_provider_metadata: Option<ProviderMetadata>,
}

impl UnifiedChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text_delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn thinking(delta: impl Into<String>) -> Self {
        Self {
            thinking_delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn tool_calls(deltas: Vec<ToolCallDelta>) -> Self {
        Self {
            tool_call_deltas: deltas,
            ..Self::default()
        }
    }

    pub fn usage(usage: ChunkUsage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    pub fn terminal(finish_reason: FinishReason, usage: Option<ChunkUsage>) -> Self {
        Self {
            finish_reason: Some(finish_reason),
            usage: usage.filter(|usage| !usage.is_empty()),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// True when no field carries anything. Empty strings count as empty.
    pub fn is_empty(&self) -> bool {
        fn blank(value: &Option<String>) -> bool {
            value.as_deref().map_or(true, str::is_empty)
        }

        blank(&self.text_delta)
            && blank(&self.thinking_delta)
            && self.thinking_id.is_none()
            && blank(&self.thinking_signature)
            && self.thinking_provider_metadata.is_none()
            && self.tool_call_deltas.is_empty()
            && self.finish_reason.is_none()
            && self.usage.map_or(true, |usage| usage.is_empty())
            && self.text_provider_metadata.is_none()
    }

    /// Empty chunks are dropped; the terminal chunk always survives.
    pub fn should_emit(&self) -> bool {
        self.is_terminal() || !self.is_empty()
    }
}
