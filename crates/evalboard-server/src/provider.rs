//! Response generators backed by configured providers
//!
//! - [`OpenAiCompatibleGenerator`]: `POST {base_url}/chat/completions`
//! - [`ProviderRouter`]: dispatches each request by its provider id

use crate::config::{ConfigError, ProviderConfig, ProviderKind};
use async_trait::async_trait;
use evalboard_core::generator::{count_tokens, elapsed_ms};
use evalboard_core::{
    Generation, GenerationError, GenerationRequest, MockGenerator, ProviderId, ResponseGenerator,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Longest error body kept in a [`GenerationError::Http`]
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

/// Chat-completions client for OpenAI-compatible servers
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleGenerator {
    /// Create a client rooted at `base_url`
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        }
    }

    /// With a custom client (timeouts, proxies)
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Request URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiCompatibleGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let body = ChatRequest {
            model: request.model_id.as_str(),
            messages: [ChatMessage {
                role: "user",
                content: &request.input,
            }],
        };

        let start = Instant::now();
        let mut call = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let response = call.send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| text.is_char_boundary(*i))
                    .unwrap_or(0);
                text.truncate(cut);
            }
            return Err(GenerationError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        let latency_ms = elapsed_ms(start);

        let output = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::InvalidResponse("no choices in response".into()))?;
        let token_count = parsed.usage.map_or_else(
            || count_tokens(&request.input) + count_tokens(&output),
            |u| u.total_tokens,
        );

        Ok(Generation {
            output,
            latency_ms,
            token_count: Some(token_count),
        })
    }
}

fn transport(err: reqwest::Error) -> GenerationError {
    GenerationError::Transport(err.to_string())
}

/// Routes requests to the generator registered for their provider id
#[derive(Default, Clone)]
pub struct ProviderRouter {
    providers: HashMap<ProviderId, Arc<dyn ResponseGenerator>>,
}

impl ProviderRouter {
    /// Create empty router
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator under `id`, replacing any previous one
    #[must_use]
    pub fn with_provider(
        mut self,
        id: impl Into<ProviderId>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        self.providers.insert(id.into(), generator);
        self
    }

    /// Build generators for every configured provider
    pub fn from_config(providers: &[ProviderConfig]) -> Result<Self, ConfigError> {
        let mut router = Self::new();
        for provider in providers {
            let generator: Arc<dyn ResponseGenerator> = match provider.kind {
                ProviderKind::Mock => Arc::new(MockGenerator::new(Duration::from_millis(
                    provider.latency_ms.unwrap_or(50),
                ))),
                ProviderKind::OpenaiCompatible => {
                    let base_url = provider.base_url.as_deref().ok_or_else(|| {
                        ConfigError::Invalid(format!("provider {} needs a base_url", provider.id))
                    })?;
                    Arc::new(OpenAiCompatibleGenerator::new(
                        base_url,
                        api_key(provider),
                    ))
                }
            };
            tracing::debug!(provider = %provider.id, kind = ?provider.kind, "provider registered");
            router = router.with_provider(provider.id.clone(), generator);
        }
        Ok(router)
    }

    /// Registered provider ids
    pub fn ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.providers.keys()
    }
}

fn api_key(provider: &ProviderConfig) -> Option<String> {
    let var = provider.api_key_env.as_deref()?;
    match std::env::var(var) {
        Ok(key) => Some(key),
        Err(_) => {
            tracing::warn!(provider = %provider.id, var, "api key variable not set");
            None
        }
    }
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ResponseGenerator for ProviderRouter {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let generator = self
            .providers
            .get(&request.provider_id)
            .ok_or_else(|| GenerationError::UnknownProvider(request.provider_id.to_string()))?;
        generator.generate(request).await
    }
}
