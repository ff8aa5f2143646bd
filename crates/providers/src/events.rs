//! Typed notifications emitted by each component
//!
//! Every component owns a [`common::EventBus`] of its own event type; the
//! [`AiSystem`](crate::system::AiSystem) forwards all of them into a single
//! bus of [`AiEvent`]. Timestamps are carried by the bus envelope.

use serde::Serialize;
use uuid::Uuid;

use crate::config::ProviderKind;
use crate::error::ErrorKind;
use crate::health::HealthStatus;
use crate::provider::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RegistryEvent {
    ProviderAdded {
        provider: String,
        kind: ProviderKind,
    },
    ProviderRemoved {
        provider: String,
    },
    ProviderError {
        provider: String,
        kind: ErrorKind,
        error: String,
    },
    ProviderUnhealthy {
        provider: String,
    },
    ProviderRecovered {
        provider: String,
        attempt: u32,
    },
    ProviderRecoveryFailed {
        provider: String,
        attempts: u32,
    },
    HealthSweepComplete {
        total: usize,
        healthy: usize,
        unhealthy: usize,
    },
}

impl RegistryEvent {
    pub fn provider(&self) -> Option<&str> {
        match self {
            RegistryEvent::ProviderAdded { provider, .. }
            | RegistryEvent::ProviderRemoved { provider }
            | RegistryEvent::ProviderError { provider, .. }
            | RegistryEvent::ProviderUnhealthy { provider }
            | RegistryEvent::ProviderRecovered { provider, .. }
            | RegistryEvent::ProviderRecoveryFailed { provider, .. } => Some(provider),
            RegistryEvent::HealthSweepComplete { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HealthEvent {
    HealthCheckComplete {
        provider: String,
        status: HealthStatus,
        overall_passed: bool,
    },
    ProviderUnhealthy {
        provider: String,
        status: HealthStatus,
        failed_checks: Vec<String>,
    },
    SystemHealthCheckComplete {
        status: HealthStatus,
        total: usize,
        healthy: usize,
        degraded: usize,
        unhealthy: usize,
        unknown: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RetryEvent {
    RetryAttempt {
        operation: String,
        provider: Option<String>,
        /// Number of the attempt about to run, starting at 2
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error_kind: ErrorKind,
        error: String,
    },
    RetrySuccess {
        operation: String,
        provider: Option<String>,
        attempts: u32,
    },
    RetryFailed {
        operation: String,
        provider: Option<String>,
        attempts: u32,
        error_kind: ErrorKind,
        error: String,
    },
}

/// Everything the AI system reports to outside observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "data", rename_all = "kebab-case")]
pub enum AiEvent {
    Registry(RegistryEvent),
    Health(HealthEvent),
    Retry(RetryEvent),
    GenerationComplete {
        request_id: Uuid,
        provider: String,
        model: String,
        usage: TokenUsage,
        duration_ms: u64,
    },
    Initialized {
        providers: Vec<String>,
    },
    InitializationFailed {
        error: String,
    },
    Shutdown,
}

impl From<RegistryEvent> for AiEvent {
    fn from(event: RegistryEvent) -> Self {
        AiEvent::Registry(event)
    }
}

impl From<HealthEvent> for AiEvent {
    fn from(event: HealthEvent) -> Self {
        AiEvent::Health(event)
    }
}

impl From<RetryEvent> for AiEvent {
    fn from(event: RetryEvent) -> Self {
        AiEvent::Retry(event)
    }
}
