//! Resilience layer over AI text generation backends.
//!
//! [`AiSystem`] is the entry point: it owns a [`ProviderRegistry`] of live
//! providers, a [`HealthChecker`] that scores them, and a [`RetryExecutor`]
//! that absorbs transient failures.

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod system;

pub use config::{AiSystemConfig, ProviderConfig, ProviderConfigUpdate, ProviderKind, ProviderSettings};
pub use error::{ErrorKind, ProviderError, Result};
pub use events::{AiEvent, HealthEvent, RegistryEvent, RetryEvent};
pub use health::{
    CheckResult, HealthCheck, HealthChecker, HealthCheckerConfig, HealthMetrics, HealthStatus,
    ProviderHealthReport, SystemHealthReport,
};
pub use provider::{
    Capabilities, Capability, GenerationRequest, GenerationResponse, Provider, ProviderFactory,
    SharedConfig, TextStream, TokenUsage,
};
pub use registry::{ProviderRegistry, ProviderStatus, RegistryConfig, RegistryStatus};
pub use retry::{RetryConfig, RetryContext, RetryExecutor, RetryMetrics};
pub use stream::GenerationStream;
pub use system::{AiSystem, SystemHealth, SystemState};
