use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ConfigError, InferenceConfig, ProviderConfig, ProviderKind};
use crate::dispatch::{
    join_url, shared_http_client, DispatcherRef, HttpSseConnector, RetryPolicy,
    RetryingDispatcher, Route,
};
use crate::error::InferenceError;
use crate::providers::anthropic::{AnthropicConverter, AnthropicDecoder, ANTHROPIC_VERSION};
use crate::providers::google::{GoogleConverter, GoogleDecoder, STREAM_ROUTE_SUFFIX};
use crate::providers::openai_chat::{OpenAiChatConverter, OpenAiChatDecoder};
use crate::providers::openai_responses::{OpenAiResponsesConverter, OpenAiResponsesDecoder};
use crate::providers::stub::{StubConverter, StubDecoder, StubDispatcher};
use crate::providers::{decoder_factory, DecoderFactory, MessageConverterRef};

/// Everything needed to run one call against a provider.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub converter: MessageConverterRef,
    pub decoder_factory: DecoderFactory,
    pub dispatcher: DispatcherRef,
    /// Text deltas carry `<think>` spans that must be split out.
    pub inline_reasoning_tags: bool,
}

impl ResolvedProvider {
    pub fn stub() -> Self {
        Self {
            converter: Arc::new(StubConverter),
            decoder_factory: decoder_factory(StubDecoder::new),
            dispatcher: Arc::new(StubDispatcher),
            inline_reasoning_tags: false,
        }
    }
}

/// Provider id to resolved provider. Built once, read-only afterwards; share
/// it behind an `Arc`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    test_mode: bool,
    providers: BTreeMap<String, ResolvedProvider>,
}

impl ProviderRegistry {
    /// Builds every configured provider. In test mode no vendor provider is
    /// built and credentials are not required.
    pub fn from_config(config: &InferenceConfig) -> Result<Self, ConfigError> {
        if config.test_mode {
            return Ok(Self::test_mode());
        }

        let mut registry = Self::default();
        for (id, provider) in &config.providers {
            let resolved = build_provider(provider, config.retry)?;
            debug!(
                provider = %id,
                kind = provider.kind.as_str(),
                endpoint = provider.endpoint(),
                "registered provider"
            );
            registry.providers.insert(id.clone(), resolved);
        }
        Ok(registry)
    }

    pub fn test_mode() -> Self {
        Self {
            test_mode: true,
            providers: BTreeMap::new(),
        }
    }

    pub fn with_provider(mut self, id: impl Into<String>, provider: ResolvedProvider) -> Self {
        self.providers.insert(id.into(), provider);
        self
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn resolve(&self, provider_id: &str) -> Result<ResolvedProvider, InferenceError> {
        if self.test_mode {
            return Ok(ResolvedProvider::stub());
        }
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| InferenceError::provider_not_supported(provider_id))
    }
}

fn build_provider(
    provider: &ProviderConfig,
    policy: RetryPolicy,
) -> Result<ResolvedProvider, ConfigError> {
    let base_url = provider.endpoint().trim();
    if base_url.is_empty() {
        return Err(ConfigError::EmptyBaseUrl {
            provider: provider.id.clone(),
        });
    }
    let api_key = provider.credentials()?;
    let client = shared_http_client(base_url);

    let mut headers = match provider.kind {
        ProviderKind::OpenaiChat | ProviderKind::OpenaiResponses => {
            vec![("authorization".to_string(), format!("Bearer {api_key}"))]
        }
        ProviderKind::Anthropic => vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ],
        ProviderKind::Google => vec![("x-goog-api-key".to_string(), api_key.to_string())],
    };
    headers.extend(
        provider
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone())),
    );

    let label = provider.id.clone();
    let (connector, converter, factory) = match provider.kind {
        ProviderKind::OpenaiChat => (
            HttpSseConnector::new(client, label, join_url(base_url, "chat/completions"), headers),
            Arc::new(OpenAiChatConverter {
                max_tokens: provider.max_tokens,
                supports_required_tool_choice: provider.supports_required_tool_choice,
            }) as MessageConverterRef,
            decoder_factory(OpenAiChatDecoder::new),
        ),
        ProviderKind::OpenaiResponses => (
            HttpSseConnector::new(client, label, join_url(base_url, "responses"), headers),
            Arc::new(OpenAiResponsesConverter {
                max_tokens: provider.max_tokens,
                reasoning: provider.thinking_enabled(),
            }) as MessageConverterRef,
            decoder_factory(OpenAiResponsesDecoder::new),
        ),
        ProviderKind::Anthropic => {
            let mut converter = AnthropicConverter {
                thinking_budget: provider.thinking_budget,
                ..AnthropicConverter::default()
            };
            if let Some(max_tokens) = provider.max_tokens {
                converter.max_tokens = max_tokens;
            }
            (
                HttpSseConnector::new(client, label, join_url(base_url, "messages"), headers),
                Arc::new(converter) as MessageConverterRef,
                decoder_factory(AnthropicDecoder::new),
            )
        }
        ProviderKind::Google => (
            HttpSseConnector::new(client, label, base_url, headers).with_route(Route::ModelPath {
                suffix: STREAM_ROUTE_SUFFIX.to_string(),
            }),
            Arc::new(GoogleConverter {
                max_tokens: provider.max_tokens,
                thinking_budget: provider.thinking_budget,
            }) as MessageConverterRef,
            decoder_factory(GoogleDecoder::new),
        ),
    };

    Ok(ResolvedProvider {
        converter,
        decoder_factory: factory,
        dispatcher: Arc::new(RetryingDispatcher::new(
            provider.id.clone(),
            connector,
            policy,
        )),
        inline_reasoning_tags: provider.inline_reasoning_tags,
    })
}
