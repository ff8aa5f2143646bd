//! Provider trait and the request/response types it speaks

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crate::config::{ProviderConfig, ProviderConfigUpdate, ProviderKind};
use crate::error::Result;

pub mod factory;

pub use factory::ProviderFactory;

/// A stream of generated text chunks.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Optional operations a provider supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Generation,
    Streaming,
    ModelListing,
    ModelLoading,
}

pub type Capabilities = HashSet<Capability>;

/// Request object for providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Falls back to the provider's default model
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Provider to use when it is healthy; ignored by providers themselves
    pub preferred_provider: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_parameters(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Rough estimate for backends that do not report usage.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        Self::new(prompt.len() as u32 / 4, completion.len() as u32 / 4)
    }
}

/// Response object from providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    #[serde(rename = "response_time_ms", with = "crate::config::duration_ms")]
    pub response_time: Duration,
}

/// A single backend endpoint capable of producing text generations.
///
/// The registry and health checker only ever see providers through this
/// trait; concrete backends are created by a [`ProviderFactory`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique registry key
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Snapshot of the current configuration
    fn config(&self) -> ProviderConfig;

    /// Hot-swap configuration fields.
    async fn update_config(&self, update: &ProviderConfigUpdate) -> Result<()>;

    /// Establish connectivity before the provider is marked usable.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources; called on removal and shutdown.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<bool>;

    async fn list_models(&self) -> Result<Vec<String>>;

    async fn load_model(&self, _model: &str) -> Result<()> {
        Ok(())
    }

    async fn unload_model(&self, _model: &str) -> Result<()> {
        Ok(())
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse>;

    /// Stream generated text. Providers without native streaming yield the
    /// full completion as a single chunk.
    async fn generate_stream(&self, request: GenerationRequest) -> Result<TextStream> {
        let response = self.generate(request).await?;
        Ok(Box::pin(stream::once(async move { Ok(response.content) })))
    }
}

/// Configuration cell shared by provider implementations.
#[derive(Debug)]
pub struct SharedConfig {
    inner: RwLock<ProviderConfig>,
}

impl SharedConfig {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn get(&self) -> ProviderConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a validated update, leaving the current value in place on error.
    pub fn apply(&self, update: &ProviderConfigUpdate) -> Result<ProviderConfig> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let next = guard.apply(update);
        next.validate()?;
        *guard = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;

    #[test]
    fn usage_total_saturates() {
        let usage = TokenUsage::new(u32::MAX, 7);
        assert_eq!(usage.total_tokens, u32::MAX);
        assert_eq!(TokenUsage::new(3, 4).total_tokens, 7);
    }

    #[test]
    fn shared_config_rejects_invalid_updates() {
        let cell = SharedConfig::new(ProviderConfig::new(
            "ollama",
            ProviderSettings::local("http://localhost:11434"),
        ));
        let bad = ProviderConfigUpdate {
            max_concurrent_requests: Some(0),
            ..Default::default()
        };
        assert!(cell.apply(&bad).is_err());
        assert_eq!(cell.get().max_concurrent_requests, 10);

        let good = ProviderConfigUpdate {
            priority: Some(5),
            ..Default::default()
        };
        assert_eq!(cell.apply(&good).expect("valid").priority, 5);
        assert_eq!(cell.get().priority, 5);
    }

    #[test]
    fn request_builder_and_usage_estimate() {
        let request = GenerationRequest::new("hello")
            .with_model("llama2")
            .with_parameters(Some(16), Some(0.2))
            .prefer("ollama");
        assert_eq!(request.model.as_deref(), Some("llama2"));
        assert_eq!(request.preferred_provider.as_deref(), Some("ollama"));

        let usage = TokenUsage::estimate("12345678", "1234");
        assert_eq!(usage, TokenUsage::new(2, 1));
        assert_eq!(usage.total_tokens, 3);
    }
}
