use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{byte_lines, error_from_response};
use crate::config::{
    ProviderConfig, ProviderConfigUpdate, ProviderKind, ProviderSettings, DEFAULT_CLOUD_MODEL,
};
use crate::error::{ProviderError, Result};
use crate::provider::{
    Capabilities, Capability, GenerationRequest, GenerationResponse, Provider, ProviderFactory,
    SharedConfig, TextStream, TokenUsage,
};

/// Hosted provider speaking the OpenAI-compatible chat completions API.
#[derive(Debug)]
pub struct CloudApiProvider {
    name: String,
    config: SharedConfig,
    client: Client,
}

impl CloudApiProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Result<Self> {
        if !matches!(config.settings, ProviderSettings::CloudApi { .. }) {
            return Err(ProviderError::Configuration(format!(
                "provider '{}' is not a cloud-api provider",
                config.name
            )));
        }
        config.validate()?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            config: SharedConfig::new(config),
            client,
        })
    }

    /// Authenticated request builder for `path` under the base URL.
    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let config = self.config.get();
        let (base_url, api_key, organization) = match config.settings {
            ProviderSettings::CloudApi {
                base_url,
                api_key,
                organization,
            } => (base_url, api_key, organization),
            _ => (String::new(), String::new(), None),
        };

        let mut builder = self
            .client
            .request(method, format!("{}/{}", base_url.trim_end_matches('/'), path))
            .bearer_auth(api_key);
        if let Some(organization) = organization {
            builder = builder.header("OpenAI-Organization", organization);
        }
        builder
    }

    fn chat_body<'a>(&self, request: &'a GenerationRequest, model: &'a str, stream: bool) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        ChatRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        }
    }

    fn model_for(&self, request: &GenerationRequest) -> String {
        self.config
            .get()
            .resolve_model(request.model.as_deref())
            .unwrap_or_else(|| DEFAULT_CLOUD_MODEL.to_string())
    }
}

#[async_trait]
impl Provider for CloudApiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudApi
    }

    fn capabilities(&self) -> Capabilities {
        [
            Capability::Generation,
            Capability::Streaming,
            Capability::ModelListing,
        ]
        .into_iter()
        .collect()
    }

    fn config(&self) -> ProviderConfig {
        self.config.get()
    }

    async fn update_config(&self, update: &ProviderConfigUpdate) -> Result<()> {
        self.config.apply(update)?;
        debug!("Updated configuration of {}", self.name);
        Ok(())
    }

    /// Verifies credentials by listing models.
    async fn initialize(&self) -> Result<()> {
        let models = self.list_models().await?;
        info!("Cloud provider {} initialized ({} models)", self.name, models.len());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, "models")
            .timeout(self.config.get().timeout)
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, "models")
            .timeout(self.config.get().timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let list: ModelList = response.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let start = Instant::now();
        let model = self.model_for(&request);
        let body = self.chat_body(&request, &model, false);

        debug!("Sending chat completion to {} (model: {})", self.name, model);

        let response = self
            .request(reqwest::Method::POST, "chat/completions")
            .timeout(self.config.get().timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let completion: ChatCompletion = response.json().await?;
        let choice = completion.choices.into_iter().next().ok_or_else(|| {
            ProviderError::ProviderUnavailable("malformed response: no choices returned".into())
        })?;
        let content = choice.message.content.unwrap_or_default();
        let usage = completion
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| TokenUsage::estimate(&request.prompt, &content));

        Ok(GenerationResponse {
            content,
            model: completion.model.unwrap_or(model),
            provider: self.name.clone(),
            usage,
            finish_reason: choice.finish_reason,
            response_time: start.elapsed(),
        })
    }

    async fn generate_stream(&self, request: GenerationRequest) -> Result<TextStream> {
        let model = self.model_for(&request);
        let body = self.chat_body(&request, &model, true);

        let response = self
            .request(reqwest::Method::POST, "chat/completions")
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let chunks = byte_lines(response.bytes_stream())
            .take_while(|line| {
                let done = matches!(line, Ok(l) if l.trim_start_matches("data:").trim() == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|line| async move {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => return Some(Err(e)),
                };
                let data = line.strip_prefix("data:")?.trim();
                match serde_json::from_str::<ChatChunk>(data) {
                    Ok(chunk) => chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                        .map(Ok),
                    Err(e) => Some(Err(e.into())),
                }
            });

        Ok(chunks.boxed())
    }
}

/// Builds [`CloudApiProvider`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloudApiFactory;

impl ProviderFactory for CloudApiFactory {
    fn create(&self, name: &str, config: ProviderConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(CloudApiProvider::new(name, config)?))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
