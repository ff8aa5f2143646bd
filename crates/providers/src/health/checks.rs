//! Individual health checks

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ProviderError, Result};
use crate::provider::{GenerationRequest, Provider};

pub const CONNECTIVITY: &str = "connectivity";
pub const MODEL_AVAILABILITY: &str = "model-availability";
pub const RESPONSE_TEST: &str = "response-test";

/// One facet of a provider's health.
///
/// `run` returns a short description on success; any error is a failed check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// A failing critical check makes the provider unhealthy.
    fn critical(&self) -> bool {
        false
    }

    /// Overrides the checker's default timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, provider: &dyn Provider) -> Result<String>;
}

/// Outcome of one check against one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub critical: bool,
    pub message: String,
    #[serde(rename = "duration_ms", with = "crate::config::duration_ms")]
    pub duration: Duration,
}

/// Run a check, converting errors and timeouts into a failed result.
pub(crate) async fn run_check(
    check: &dyn HealthCheck,
    provider: &dyn Provider,
    default_timeout: Duration,
) -> CheckResult {
    let limit = check.timeout().unwrap_or(default_timeout);
    let start = Instant::now();

    let (passed, message) = match tokio::time::timeout(limit, check.run(provider)).await {
        Ok(Ok(message)) => (true, message),
        Ok(Err(e)) => (false, e.to_string()),
        Err(_) => (false, format!("check timed out after {}ms", limit.as_millis())),
    };

    debug!(
        provider = provider.name(),
        check = check.name(),
        passed,
        "{}",
        message
    );

    CheckResult {
        name: check.name().to_string(),
        passed,
        critical: check.critical(),
        message,
        duration: start.elapsed(),
    }
}

/// The provider's own liveness probe.
#[derive(Debug, Default)]
pub struct ConnectivityCheck;

#[async_trait]
impl HealthCheck for ConnectivityCheck {
    fn name(&self) -> &str {
        CONNECTIVITY
    }

    fn critical(&self) -> bool {
        true
    }

    async fn run(&self, provider: &dyn Provider) -> Result<String> {
        if provider.health_check().await? {
            Ok("provider is reachable".to_string())
        } else {
            Err(ProviderError::ProviderUnavailable(
                "health probe reported the provider as down".into(),
            ))
        }
    }
}

/// At least one model must be listed.
#[derive(Debug, Default)]
pub struct ModelAvailabilityCheck;

#[async_trait]
impl HealthCheck for ModelAvailabilityCheck {
    fn name(&self) -> &str {
        MODEL_AVAILABILITY
    }

    async fn run(&self, provider: &dyn Provider) -> Result<String> {
        let models = provider.list_models().await?;
        if models.is_empty() {
            return Err(ProviderError::Model("no models available".into()));
        }
        Ok(format!("{} models available", models.len()))
    }
}

/// Issues a minimal generation and requires a non-empty answer.
#[derive(Debug)]
pub struct ResponseTestCheck {
    prompt: String,
    timeout: Duration,
}

impl ResponseTestCheck {
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthCheck for ResponseTestCheck {
    fn name(&self) -> &str {
        RESPONSE_TEST
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn run(&self, provider: &dyn Provider) -> Result<String> {
        let request = GenerationRequest::new(self.prompt.clone()).with_parameters(Some(10), Some(0.0));
        let response = provider.generate(request).await?;
        if response.content.trim().is_empty() {
            return Err(ProviderError::Model("empty response to test prompt".into()));
        }
        Ok(format!(
            "responded in {}ms",
            response.response_time.as_millis()
        ))
    }
}
