//! Configuration model consumed by the AI system
//!
//! Provider connection parameters are a tagged union keyed by provider type,
//! so each variant carries only the fields that make sense for it:
//!
//! ```yaml
//! environment: production
//! routing:
//!   production: openai
//! providers:
//!   - name: ollama
//!     type: local-model-runner
//!     base_url: http://localhost:11434
//!     models: [llama2]
//!   - name: openai
//!     type: cloud-api
//!     api_key: sk-...
//!     default_model: gpt-4o-mini
//!     priority: 10
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use crate::error::{ProviderError, Result};
use crate::health::HealthCheckerConfig;
use crate::registry::RegistryConfig;
use crate::retry::RetryConfig;

pub const DEFAULT_LOCAL_URL: &str = "http://localhost:11434";
pub const DEFAULT_CLOUD_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LOCAL_MODEL: &str = "llama2";
pub const DEFAULT_CLOUD_MODEL: &str = "gpt-3.5-turbo";

/// Provider type identifier; factories are registered against these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    LocalModelRunner,
    CloudApi,
    Custom,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::LocalModelRunner => "local-model-runner",
            ProviderKind::CloudApi => "cloud-api",
            ProviderKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters, one variant per provider type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderSettings {
    LocalModelRunner {
        #[serde(default = "default_local_url")]
        base_url: String,
        /// Pull configured models that the runner does not have yet
        #[serde(default)]
        auto_pull: bool,
    },
    CloudApi {
        #[serde(default = "default_cloud_url")]
        base_url: String,
        api_key: String,
        #[serde(default)]
        organization: Option<String>,
    },
    Custom {
        endpoint: String,
        #[serde(default)]
        options: HashMap<String, serde_json::Value>,
    },
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSettings::LocalModelRunner { .. } => ProviderKind::LocalModelRunner,
            ProviderSettings::CloudApi { .. } => ProviderKind::CloudApi,
            ProviderSettings::Custom { .. } => ProviderKind::Custom,
        }
    }

    pub fn local(base_url: impl Into<String>) -> Self {
        ProviderSettings::LocalModelRunner {
            base_url: base_url.into(),
            auto_pull: false,
        }
    }

    pub fn cloud(api_key: impl Into<String>) -> Self {
        ProviderSettings::CloudApi {
            base_url: default_cloud_url(),
            api_key: api_key.into(),
            organization: None,
        }
    }

    pub fn custom(endpoint: impl Into<String>) -> Self {
        ProviderSettings::Custom {
            endpoint: endpoint.into(),
            options: HashMap::new(),
        }
    }
}

/// Per-provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: ProviderSettings,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Higher priorities are registered first
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "timeout_ms", with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, settings: ProviderSettings) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            settings,
            models: Vec::new(),
            default_model: None,
            priority: 0,
            timeout: default_timeout(),
            retries: default_retries(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.settings.kind()
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Model used when a request does not name one.
    pub fn resolve_model(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(str::to_string)
            .or_else(|| self.default_model.clone())
            .or_else(|| self.models.first().cloned())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProviderError::Configuration(
                "provider name must not be empty".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ProviderError::Configuration(format!(
                "provider '{}': timeout must be greater than zero",
                self.name
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ProviderError::Configuration(format!(
                "provider '{}': max_concurrent_requests must be at least 1",
                self.name
            )));
        }
        match &self.settings {
            ProviderSettings::CloudApi { api_key, .. } if api_key.trim().is_empty() => {
                Err(ProviderError::Configuration(format!(
                    "provider '{}': cloud-api providers require an api_key",
                    self.name
                )))
            }
            ProviderSettings::Custom { endpoint, .. } if endpoint.trim().is_empty() => {
                Err(ProviderError::Configuration(format!(
                    "provider '{}': custom providers require an endpoint",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }

    /// Apply a partial update, returning the new configuration.
    pub fn apply(&self, update: &ProviderConfigUpdate) -> ProviderConfig {
        let mut next = self.clone();
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(models) = &update.models {
            next.models = models.clone();
        }
        if let Some(model) = &update.default_model {
            next.default_model = Some(model.clone());
        }
        if let Some(priority) = update.priority {
            next.priority = priority;
        }
        if let Some(timeout) = update.timeout {
            next.timeout = timeout;
        }
        if let Some(retries) = update.retries {
            next.retries = retries;
        }
        if let Some(max) = update.max_concurrent_requests {
            next.max_concurrent_requests = max;
        }
        next
    }
}

/// Partial provider configuration update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfigUpdate {
    pub enabled: Option<bool>,
    pub models: Option<Vec<String>>,
    pub default_model: Option<String>,
    pub priority: Option<i32>,
    #[serde(rename = "timeout_ms", with = "option_duration_ms", default)]
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub max_concurrent_requests: Option<usize>,
}

/// Top level configuration of the AI system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSystemConfig {
    /// Selects the routing table entry, e.g. "development" or "production"
    pub environment: String,
    pub providers: Vec<ProviderConfig>,
    /// environment -> provider name
    pub routing: HashMap<String, String>,
    /// Providers of this type may fail to initialise without aborting startup
    pub default_provider_kind: ProviderKind,
    pub health: HealthCheckerConfig,
    pub registry: RegistryConfig,
    pub retry: RetryConfig,
}

impl Default for AiSystemConfig {
    fn default() -> Self {
        let mut routing = HashMap::new();
        routing.insert("development".to_string(), "ollama".to_string());
        routing.insert("production".to_string(), "openai".to_string());

        Self {
            environment: "development".to_string(),
            providers: Vec::new(),
            routing,
            default_provider_kind: ProviderKind::LocalModelRunner,
            health: HealthCheckerConfig::default(),
            registry: RegistryConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl AiSystemConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ProviderError::Configuration(format!("invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| ProviderError::Configuration(format!("invalid YAML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from process environment variables, loading a
    /// `.env` file first when one exists.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    ///
    /// Recognised variables: `AI_ENVIRONMENT`, `OLLAMA_URL`, `OLLAMA_MODELS`
    /// (comma separated), `OLLAMA_ENABLED`, `OPENAI_API_KEY`,
    /// `OPENAI_BASE_URL`, `OPENAI_MODEL`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(environment) = lookup("AI_ENVIRONMENT").filter(|v| !v.is_empty()) {
            config.environment = environment;
        }

        let ollama_enabled = lookup("OLLAMA_ENABLED")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);
        if ollama_enabled {
            let base_url = lookup("OLLAMA_URL").unwrap_or_else(default_local_url);
            let models: Vec<String> = lookup("OLLAMA_MODELS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec![DEFAULT_LOCAL_MODEL.to_string()]);
            let default_model = models
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
            config.providers.push(
                ProviderConfig::new("ollama", ProviderSettings::local(base_url))
                    .with_models(models)
                    .with_default_model(default_model)
                    .with_timeout(Duration::from_secs(120)),
            );
        }

        if let Some(api_key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            let base_url = lookup("OPENAI_BASE_URL").unwrap_or_else(default_cloud_url);
            let model = lookup("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_CLOUD_MODEL.to_string());
            config.providers.push(
                ProviderConfig::new(
                    "openai",
                    ProviderSettings::CloudApi {
                        base_url,
                        api_key,
                        organization: lookup("OPENAI_ORGANIZATION"),
                    },
                )
                .with_models(vec![model.clone()])
                .with_default_model(model)
                .with_priority(10),
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(provider.name.as_str()) {
                return Err(ProviderError::Configuration(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
        }
        if self.environment.trim().is_empty() {
            return Err(ProviderError::Configuration(
                "environment must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Provider configured as default for the current environment.
    pub fn default_provider_for_environment(&self) -> Option<&str> {
        self.routing.get(&self.environment).map(String::as_str)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn provider_mut(&mut self, name: &str) -> Option<&mut ProviderConfig> {
        self.providers.iter_mut().find(|p| p.name == name)
    }

    pub fn is_provider_enabled(&self, name: &str) -> bool {
        self.provider(name).map(|p| p.enabled).unwrap_or(false)
    }

    /// Enabled providers, highest priority first; equal priorities keep
    /// their configured order.
    pub fn enabled_providers_by_priority(&self) -> Vec<ProviderConfig> {
        let mut enabled: Vec<ProviderConfig> =
            self.providers.iter().filter(|p| p.enabled).cloned().collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority));
        enabled
    }
}

fn default_true() -> bool {
    true
}

fn default_local_url() -> String {
    DEFAULT_LOCAL_URL.to_string()
}

fn default_cloud_url() -> String {
    DEFAULT_CLOUD_URL.to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retries() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    10
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
