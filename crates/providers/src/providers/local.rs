use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{byte_lines, error_from_response};
use crate::config::{
    ProviderConfig, ProviderConfigUpdate, ProviderKind, ProviderSettings, DEFAULT_LOCAL_MODEL,
};
use crate::error::{ProviderError, Result};
use crate::provider::{
    Capabilities, Capability, GenerationRequest, GenerationResponse, Provider, ProviderFactory,
    SharedConfig, TextStream, TokenUsage,
};

/// Local model runner speaking the Ollama HTTP API.
#[derive(Debug)]
pub struct LocalModelRunnerProvider {
    name: String,
    config: SharedConfig,
    client: Client,
}

impl LocalModelRunnerProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Result<Self> {
        if !matches!(config.settings, ProviderSettings::LocalModelRunner { .. }) {
            return Err(ProviderError::Configuration(format!(
                "provider '{}' is not a local-model-runner",
                config.name
            )));
        }
        config.validate()?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            config: SharedConfig::new(config),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        match self.config.get().settings {
            ProviderSettings::LocalModelRunner { base_url, .. } => {
                format!("{}/{}", base_url.trim_end_matches('/'), path)
            }
            // Settings variant is checked in `new` and never changes.
            _ => path.to_string(),
        }
    }

    fn auto_pull(&self) -> bool {
        matches!(
            self.config.get().settings,
            ProviderSettings::LocalModelRunner { auto_pull: true, .. }
        )
    }

    fn model_for(&self, request: &GenerationRequest) -> String {
        self.config
            .get()
            .resolve_model(request.model.as_deref())
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string())
    }

    fn build_request<'a>(&self, request: &'a GenerationRequest, model: &'a str, stream: bool) -> GenerateBody<'a> {
        GenerateBody {
            model,
            prompt: &request.prompt,
            system: request.system_prompt.as_deref(),
            stream,
            keep_alive: None,
            options: GenerateOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }

    async fn pull_model(&self, model: &str) -> Result<()> {
        info!("Pulling model '{}' into {}", model, self.name);
        let response = self
            .client
            .post(self.endpoint("api/pull"))
            .json(&PullBody { name: model, stream: false })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let status: PullStatus = response.json().await?;
        if status.status != "success" {
            return Err(ProviderError::Model(format!(
                "pull of '{}' ended with status '{}'",
                model, status.status
            )));
        }
        Ok(())
    }

    /// Pull configured models the runner does not have yet.
    async fn pull_missing_models(&self) -> Result<()> {
        let available = self.list_models().await?;
        for model in self.config.get().models {
            if !available.iter().any(|m| model_matches(m, &model)) {
                self.pull_model(&model).await?;
            }
        }
        Ok(())
    }
}

/// `llama2` matches `llama2:latest`.
fn model_matches(available: &str, wanted: &str) -> bool {
    available == wanted
        || available
            .split_once(':')
            .map(|(base, tag)| base == wanted && tag == "latest")
            .unwrap_or(false)
}

#[async_trait]
impl Provider for LocalModelRunnerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalModelRunner
    }

    fn capabilities(&self) -> Capabilities {
        [
            Capability::Generation,
            Capability::Streaming,
            Capability::ModelListing,
            Capability::ModelLoading,
        ]
        .into_iter()
        .collect()
    }

    fn config(&self) -> ProviderConfig {
        self.config.get()
    }

    async fn update_config(&self, update: &ProviderConfigUpdate) -> Result<()> {
        let next = self.config.apply(update)?;
        debug!("Updated configuration of {}: {:?}", self.name, next);
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        if !self.health_check().await? {
            return Err(ProviderError::ProviderUnavailable(format!(
                "local model runner at {} is not responding",
                self.endpoint("")
            )));
        }
        if self.auto_pull() {
            self.pull_missing_models().await?;
        }
        info!("Local model runner {} initialized", self.name);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.endpoint("api/tags"))
            .timeout(self.config.get().timeout)
            .send()
            .await?;
        let healthy = response.status().is_success();
        if !healthy {
            warn!("{} health probe returned {}", self.name, response.status());
        }
        Ok(healthy)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.endpoint("api/tags"))
            .timeout(self.config.get().timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        let available = self.list_models().await?;
        if !available.iter().any(|m| model_matches(m, model)) {
            self.pull_model(model).await?;
        }
        let body = KeepAliveBody { model, keep_alive: "5m" };
        let response = self
            .client
            .post(self.endpoint("api/generate"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        debug!("Loaded model '{}' on {}", model, self.name);
        Ok(())
    }

    async fn unload_model(&self, model: &str) -> Result<()> {
        let body = KeepAliveBody { model, keep_alive: "0" };
        let response = self
            .client
            .post(self.endpoint("api/generate"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        debug!("Unloaded model '{}' from {}", model, self.name);
        Ok(())
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let start = Instant::now();
        let model = self.model_for(&request);
        let body = self.build_request(&request, &model, false);

        debug!(
            "Sending request to {} (model: {}): {}",
            self.name,
            model,
            request.prompt.chars().take(50).collect::<String>()
        );

        let response = self
            .client
            .post(self.endpoint("api/generate"))
            .timeout(self.config.get().timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let reply: GenerateChunk = response.json().await?;
        if let Some(error) = reply.error {
            return Err(ProviderError::classify_message(error));
        }

        let usage = match (reply.prompt_eval_count, reply.eval_count) {
            (Some(prompt), Some(completion)) => TokenUsage::new(prompt, completion),
            _ => TokenUsage::estimate(&request.prompt, &reply.response),
        };

        Ok(GenerationResponse {
            content: reply.response,
            model: if reply.model.is_empty() { model } else { reply.model },
            provider: self.name.clone(),
            usage,
            finish_reason: reply.done_reason,
            response_time: start.elapsed(),
        })
    }

    async fn generate_stream(&self, request: GenerationRequest) -> Result<TextStream> {
        let model = self.model_for(&request);
        let body = self.build_request(&request, &model, true);

        let response = self
            .client
            .post(self.endpoint("api/generate"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let chunks = byte_lines(response.bytes_stream()).filter_map(|line| async move {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            match serde_json::from_str::<GenerateChunk>(&line) {
                Ok(GenerateChunk { error: Some(error), .. }) => {
                    Some(Err(ProviderError::classify_message(error)))
                }
                Ok(chunk) if chunk.response.is_empty() => None,
                Ok(chunk) => Some(Ok(chunk.response)),
                Err(e) => Some(Err(e.into())),
            }
        });

        Ok(chunks.boxed())
    }
}

/// Builds [`LocalModelRunnerProvider`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalModelRunnerFactory;

impl ProviderFactory for LocalModelRunnerFactory {
    fn create(&self, name: &str, config: ProviderConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(LocalModelRunnerProvider::new(name, config)?))
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct KeepAliveBody<'a> {
    model: &'a str,
    keep_alive: &'a str,
}

#[derive(Serialize)]
struct PullBody<'a> {
    name: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct PullStatus {
    status: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    model: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}
