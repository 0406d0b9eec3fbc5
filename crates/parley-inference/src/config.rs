use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{RetryPolicy, DEFAULT_TRANSPORT_RETRY_COUNT};

pub const TEST_MODE_ENV: &str = "PARLEY_TEST_MODE";
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path} failed: {message}")]
    Read { path: String, message: String },

    #[error("parse parley.toml failed: {0}")]
    Parse(String),

    #[error("provider '{provider}' has an empty base_url")]
    EmptyBaseUrl { provider: String },

    #[error("missing API key for provider '{provider}'; set api_key, api_key_env or {fallback_env}")]
    MissingCredentials {
        provider: String,
        fallback_env: String,
    },
}

/// Wire family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenaiChat,
    OpenaiResponses,
    Anthropic,
    Google,
}

impl ProviderKind {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenaiChat | Self::OpenaiResponses => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenaiChat => "openai-chat",
            Self::OpenaiResponses => "openai-responses",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Resolved key. `None` only when nothing was configured.
    pub api_key: Option<String>,
    /// The text channel inlines `<think>` spans that must be split out.
    pub inline_reasoning_tags: bool,
    /// OpenAI-compatible servers differ on `tool_choice: "required"`.
    pub supports_required_tool_choice: bool,
    pub max_tokens: Option<u64>,
    /// Anthropic extended thinking budget; zero disables thinking.
    pub thinking_budget: u64,
    pub headers: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            base_url: kind.default_base_url().to_string(),
            api_key: None,
            inline_reasoning_tags: false,
            supports_required_tool_choice: true,
            max_tokens: None,
            thinking_budget: 0,
            headers: BTreeMap::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingCredentials {
                provider: self.id.clone(),
                fallback_env: fallback_key_env(&self.id),
            })
    }

    pub fn thinking_enabled(&self) -> bool {
        self.thinking_budget > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceConfig {
    pub test_mode: bool,
    pub retry: RetryPolicy,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            retry: RetryPolicy::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl InferenceConfig {
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.get(id)
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.insert(provider.id.clone(), provider);
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct ParleyTomlFile {
    #[serde(default)]
    test_mode: Option<bool>,
    #[serde(default)]
    transport_retry_count: Option<usize>,
    #[serde(default)]
    retry_delay_ms: Option<u64>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    providers: BTreeMap<String, ParleyTomlProvider>,
}

#[derive(Debug, Deserialize)]
struct ParleyTomlProvider {
    kind: ProviderKind,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_key_env: Option<String>,
    #[serde(default)]
    inline_reasoning_tags: Option<bool>,
    #[serde(default)]
    supports_required_tool_choice: Option<bool>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    thinking_budget: Option<u64>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

pub fn load_inference_config(path: &Path) -> Result<InferenceConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    parse_inference_config(&content)
}

pub fn parse_inference_config(content: &str) -> Result<InferenceConfig, ConfigError> {
    let parsed: ParleyTomlFile =
        toml::from_str(content).map_err(|error| ConfigError::Parse(error.to_string()))?;

    let mut providers = BTreeMap::new();
    for (id, provider) in parsed.providers {
        let resolved = resolve_provider(&id, provider, &parsed.env)?;
        providers.insert(id, resolved);
    }

    Ok(InferenceConfig {
        test_mode: parsed.test_mode.unwrap_or(false) || test_mode_from_env(),
        retry: RetryPolicy {
            max_retries: parsed
                .transport_retry_count
                .unwrap_or(DEFAULT_TRANSPORT_RETRY_COUNT),
            delay: Duration::from_millis(parsed.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS)),
        },
        providers,
    })
}

pub fn test_mode_from_env() -> bool {
    std::env::var(TEST_MODE_ENV)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn resolve_provider(
    id: &str,
    provider: ParleyTomlProvider,
    env_map: &HashMap<String, String>,
) -> Result<ProviderConfig, ConfigError> {
    let base_url = match provider.base_url.as_deref() {
        Some(value) => resolve_config_value(value, env_map).ok_or_else(|| {
            ConfigError::EmptyBaseUrl {
                provider: id.to_string(),
            }
        })?,
        None => provider.kind.default_base_url().to_string(),
    };

    let api_key = provider
        .api_key
        .as_deref()
        .and_then(|value| resolve_config_value(value, env_map))
        .or_else(|| {
            provider
                .api_key_env
                .as_deref()
                .and_then(|key| lookup_env(key.trim(), env_map))
        })
        .or_else(|| lookup_env(&fallback_key_env(id), env_map));

    let headers = provider
        .headers
        .iter()
        .filter_map(|(name, value)| {
            resolve_config_value(value, env_map).map(|resolved| (name.clone(), resolved))
        })
        .collect();

    Ok(ProviderConfig {
        id: id.to_string(),
        kind: provider.kind,
        base_url,
        api_key,
        inline_reasoning_tags: provider.inline_reasoning_tags.unwrap_or(false),
        supports_required_tool_choice: provider.supports_required_tool_choice.unwrap_or(true),
        max_tokens: provider.max_tokens,
        thinking_budget: provider.thinking_budget.unwrap_or(0),
        headers,
    })
}

fn fallback_key_env(provider_id: &str) -> String {
    format!("{}_API_KEY", provider_id.to_uppercase().replace('-', "_"))
}

/// `$NAME` reads from the `[env]` table first, then the process environment.
fn resolve_config_value(value: &str, env_map: &HashMap<String, String>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return lookup_env(env_key, env_map);
    }
    Some(trimmed.to_string())
}

fn lookup_env(key: &str, env_map: &HashMap<String, String>) -> Option<String> {
    env_map
        .get(key)
        .cloned()
        .or_else(|| std::env::var(key).ok())
        .filter(|resolved| !resolved.trim().is_empty())
}
