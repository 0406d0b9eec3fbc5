use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized failure kinds. Vendor and transport errors never cross the
/// layer boundary in any other shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceErrorCode {
    /// Unknown or unregistered provider id. Fatal, not retried.
    ProviderNotSupported,
    /// Bad image, unsupported tool choice, malformed domain message. Fatal.
    ConversionFailed,
    /// Transport or auth failure while establishing the stream. Retried.
    ConnectionFailed,
    /// Failure after the stream opened. Never retried.
    StreamInterrupted,
}

impl InferenceErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceError {
    pub code: InferenceErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl InferenceError {
    pub fn new(code: InferenceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn provider_not_supported(provider: &str) -> Self {
        Self::new(
            InferenceErrorCode::ProviderNotSupported,
            format!("No provider registered for id: {provider}"),
        )
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(InferenceErrorCode::ConversionFailed, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(InferenceErrorCode::ConnectionFailed, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(InferenceErrorCode::StreamInterrupted, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"stream_interrupted\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for InferenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for InferenceError {}

pub(crate) fn truncate_for_details(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    if limit <= 3 {
        return ".".repeat(limit);
    }

    let prefix: String = text.chars().take(limit - 3).collect();
    format!("{prefix}...")
}
