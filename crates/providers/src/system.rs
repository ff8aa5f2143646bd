//! AI system facade
//!
//! Single entry point combining the provider registry, the health checker and
//! the retry executor. Handles startup from configuration, provider
//! selection with failover, generation and streaming, runtime provider
//! management and orderly shutdown.

use common::{EventBus, OperationTimer};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AiSystemConfig, ProviderConfig, ProviderConfigUpdate, ProviderKind};
use crate::error::{ErrorKind, ProviderError, Result};
use crate::events::AiEvent;
use crate::health::{HealthChecker, HealthStatus, SystemHealthReport};
use crate::provider::{GenerationRequest, GenerationResponse, Provider, ProviderFactory};
use crate::registry::{ProviderRegistry, RegistryStatus};
use crate::retry::{RetryContext, RetryExecutor, RetryMetrics};
use crate::stream::GenerationStream;

const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
}

impl SystemState {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemState::Uninitialized => "uninitialized",
            SystemState::Initializing => "initializing",
            SystemState::Ready => "ready",
            SystemState::ShuttingDown => "shutting-down",
            SystemState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merged view for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub state: SystemState,
    pub status: HealthStatus,
    pub registry: RegistryStatus,
    pub health: SystemHealthReport,
    pub retry: RetryMetrics,
}

pub struct AiSystem {
    config: RwLock<AiSystemConfig>,
    state: RwLock<SystemState>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthChecker>,
    retry: Arc<RetryExecutor>,
    events: EventBus<AiEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for AiSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiSystem")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl AiSystem {
    pub fn new(config: AiSystemConfig) -> Self {
        let registry = Arc::new(ProviderRegistry::new(config.registry.clone()));
        let health = Arc::new(HealthChecker::new(Arc::clone(&registry), config.health.clone()));
        let retry = Arc::new(RetryExecutor::new(config.retry.clone()));

        Self {
            config: RwLock::new(config),
            state: RwLock::new(SystemState::Uninitialized),
            registry,
            health,
            retry,
            events: EventBus::new("ai-system", 1024),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// System configured from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(AiSystemConfig::from_env()?))
    }

    pub fn state(&self) -> SystemState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SystemState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!("AI system state {} -> {}", *state, next);
        *state = next;
    }

    /// Move to `next` only if the system is still in `expected`.
    fn transition(&self, expected: SystemState, next: SystemState) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            return false;
        }
        debug!("AI system state {} -> {}", *state, next);
        *state = next;
        true
    }

    /// Fails once `shutdown` has taken over from a running startup.
    fn ensure_still_initializing(&self) -> Result<()> {
        match self.state() {
            SystemState::Initializing => Ok(()),
            other => Err(ProviderError::NotInitialized(format!(
                "{} during initialization",
                other
            ))),
        }
    }

    /// Current configuration view; always matches the registry.
    pub fn config(&self) -> AiSystemConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn retry_executor(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<common::EventEnvelope<AiEvent>> {
        self.events.subscribe()
    }

    /// Routing table entry for the current environment.
    pub fn default_provider_name(&self) -> Option<String> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .default_provider_for_environment()
            .map(str::to_string)
    }

    /// Names of registered providers in registration order.
    pub async fn available_providers(&self) -> Vec<String> {
        self.registry.provider_names().await
    }

    /// Whether at least one provider is enabled in the configuration.
    pub fn is_configured(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .providers
            .iter()
            .any(|p| p.enabled)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SystemState::Ready => Ok(()),
            other => Err(ProviderError::NotInitialized(other.to_string())),
        }
    }

    /// Bring up every enabled provider and start monitoring.
    ///
    /// Providers of the default kind may fail without aborting startup; they
    /// are marked disabled instead. Any other failure undoes the providers
    /// added so far and leaves the system uninitialized.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let current = *state;
            match current {
                SystemState::Uninitialized => *state = SystemState::Initializing,
                SystemState::Ready => {
                    debug!("AI system already initialized");
                    return Ok(());
                }
                other => {
                    return Err(ProviderError::Configuration(format!(
                        "cannot initialize AI system in state '{}'",
                        other
                    )))
                }
            }
        }

        let timer = OperationTimer::new("ai_system_initialize");
        let result = self.bring_up().await;
        timer.finish_with_result(&result);

        let error = match result {
            Ok(startup) if self.transition(SystemState::Initializing, SystemState::Ready) => {
                info!("AI system ready with providers {:?}", startup.providers);
                self.events.publish(AiEvent::Initialized {
                    providers: startup.providers,
                });
                return Ok(());
            }
            Ok(startup) => {
                warn!("AI system shut down while initializing, undoing startup");
                self.abandon_startup(&startup.added).await;
                ProviderError::NotInitialized(format!("{} during initialization", self.state()))
            }
            Err(e) => e,
        };
        self.events.publish(AiEvent::InitializationFailed {
            error: error.to_string(),
        });
        self.transition(SystemState::Initializing, SystemState::Uninitialized);
        Err(error)
    }

    /// Stop monitoring and remove the providers one startup added.
    async fn abandon_startup(&self, added: &[String]) {
        self.health.stop_monitoring();
        self.registry.stop_health_monitoring();
        for name in added.iter().rev() {
            self.registry.remove_provider(name).await;
            self.health.forget_provider(name);
        }
        self.stop_forwarders();
    }

    async fn bring_up(&self) -> Result<Startup> {
        let config = self.config();
        config.validate()?;

        self.start_forwarders();
        self.register_builtin_factories().await?;

        let mut startup = Startup::default();
        for provider in config.enabled_providers_by_priority() {
            if let Err(e) = self.ensure_still_initializing() {
                self.abandon_startup(&startup.added).await;
                return Err(e);
            }

            let name = provider.name.clone();
            let kind = provider.kind();
            // Added at runtime before startup.
            if self.registry.has_provider(&name).await {
                debug!(provider = %name, "Provider already registered");
                startup.providers.push(name);
                continue;
            }

            let outcome = self.registry.add_provider(&name, kind, provider).await;
            if let Err(e) = self.ensure_still_initializing() {
                if outcome.is_ok() {
                    startup.added.push(name);
                }
                self.abandon_startup(&startup.added).await;
                return Err(e);
            }

            match outcome {
                Ok(_) => {
                    self.health.track_provider(&name);
                    startup.added.push(name.clone());
                    startup.providers.push(name);
                }
                Err(e) if kind == config.default_provider_kind => {
                    warn!(provider = %name, "Skipping provider that failed to initialize: {}", e);
                    if let Some(entry) = self
                        .config
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .provider_mut(&name)
                    {
                        entry.enabled = false;
                    }
                }
                Err(e) => {
                    warn!(provider = %name, "Initialization failed, rolling back: {}", e);
                    self.abandon_startup(&startup.added).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.ensure_still_initializing() {
            self.abandon_startup(&startup.added).await;
            return Err(e);
        }
        self.health.start_monitoring().await;
        self.registry.start_health_monitoring(None);
        Ok(startup)
    }

    async fn register_builtin_factories(&self) -> Result<()> {
        for (kind, factory) in builtin_factories() {
            if !self.registry.has_factory(kind).await {
                self.registry.register_factory(factory, &[kind]).await?;
            }
        }
        Ok(())
    }

    fn start_forwarders(&self) {
        self.stop_forwarders();
        let handles = vec![
            forward(self.registry.events(), self.events.clone()),
            forward(self.health.events(), self.events.clone()),
            forward(self.retry.events(), self.events.clone()),
        ];
        *self.forwarders.lock().unwrap_or_else(PoisonError::into_inner) = handles;
    }

    fn stop_forwarders(&self) {
        for handle in self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }

    /// Preferred provider, then the environment default, then the first
    /// healthy provider in registration order.
    async fn select_provider(&self, request: &GenerationRequest) -> Result<Arc<dyn Provider>> {
        let default = self.default_provider_name();
        let preferred: Vec<&str> = request
            .preferred_provider
            .as_deref()
            .into_iter()
            .chain(default.as_deref())
            .collect();

        self.registry
            .get_healthy_provider(&preferred)
            .await
            .ok_or_else(|| {
                ProviderError::ProviderUnavailable("No healthy AI providers available".into())
            })
    }

    /// Feed a failed call back into metrics and recovery.
    fn note_failure(&self, provider: &str, elapsed: std::time::Duration, error: &ProviderError) {
        self.health.record_request(provider, elapsed, false);
        // Invalid requests say nothing about the provider.
        if error.kind() != ErrorKind::Validation {
            self.registry.report_provider_error(provider, error);
        }
    }

    #[instrument(skip(self, request), fields(preferred = ?request.preferred_provider))]
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        self.ensure_ready()?;
        let provider = self.select_provider(&request).await?;
        let name = provider.name().to_string();
        let config = provider.config();
        let _permit = self.registry.acquire_permit(&name).await?;

        let mut timer = OperationTimer::new("ai_generate");
        timer.add_field("provider", &name);
        let context = RetryContext::new("generate")
            .with_provider(name.clone())
            .with_timeout(config.timeout)
            .with_max_retries(config.retries);

        let start = Instant::now();
        let result = self
            .retry
            .execute_with_retry(&context, || {
                let provider = Arc::clone(&provider);
                let request = request.clone();
                async move { provider.generate(request).await }
            })
            .await;
        let elapsed = start.elapsed();
        timer.finish_with_result(&result);

        match result {
            Ok(response) => {
                self.health.record_request(&name, elapsed, true);
                self.events.publish(AiEvent::GenerationComplete {
                    request_id: Uuid::new_v4(),
                    provider: name,
                    model: response.model.clone(),
                    usage: response.usage,
                    duration_ms: elapsed.as_millis() as u64,
                });
                Ok(response)
            }
            Err(e) => {
                self.note_failure(&name, elapsed, &e);
                Err(ProviderError::for_provider(name, e))
            }
        }
    }

    /// Stream a generation from one selected provider.
    ///
    /// Opening the stream is not retried once chunks may have been delivered;
    /// a failure mid-stream ends the stream with that error.
    #[instrument(skip(self, request), fields(preferred = ?request.preferred_provider))]
    pub async fn generate_stream(&self, request: GenerationRequest) -> Result<GenerationStream> {
        self.ensure_ready()?;
        let provider = self.select_provider(&request).await?;
        let name = provider.name().to_string();
        let permit = self.registry.acquire_permit(&name).await?;

        let limit = provider.config().timeout;
        let start = Instant::now();
        let opened = tokio::time::timeout(limit, provider.generate_stream(request))
            .await
            .unwrap_or_else(|_| Err(ProviderError::timeout(limit)));
        let mut upstream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.note_failure(&name, start.elapsed(), &e);
                return Err(ProviderError::for_provider(name, e));
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let health = Arc::clone(&self.health);
        let registry = Arc::clone(&self.registry);
        let provider_name = name.clone();

        let forwarder = tokio::spawn(async move {
            let _permit = permit;
            let mut failure = None;
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(text) => {
                        if tx.send(Ok(text)).await.is_err() {
                            debug!(provider = %provider_name, "Stream receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(provider = %provider_name, "Stream failed: {}", e);
                        failure = Some(e.clone());
                        let _ = tx
                            .send(Err(ProviderError::for_provider(provider_name.clone(), e)))
                            .await;
                        break;
                    }
                }
            }

            let elapsed = start.elapsed();
            match failure {
                None => health.record_request(&provider_name, elapsed, true),
                Some(e) => {
                    health.record_request(&provider_name, elapsed, false);
                    if e.kind() != ErrorKind::Validation {
                        registry.report_provider_error(&provider_name, &e);
                    }
                }
            }
        });

        Ok(GenerationStream::new(name, ReceiverStream::new(rx), forwarder))
    }

    /// Add a provider at runtime and record it in the configuration.
    pub async fn add_provider(&self, config: ProviderConfig) -> Result<Arc<dyn Provider>> {
        config.validate()?;
        if self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .provider(&config.name)
            .is_some()
        {
            return Err(ProviderError::DuplicateProviderName(config.name));
        }

        let provider = self
            .registry
            .add_provider(&config.name, config.kind(), config.clone())
            .await?;
        self.health.track_provider(&config.name);
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .providers
            .push(config);
        Ok(provider)
    }

    /// Remove a provider from the registry and the configuration.
    pub async fn remove_provider(&self, name: &str) -> bool {
        let removed = self.registry.remove_provider(name).await;
        self.health.forget_provider(name);
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let before = config.providers.len();
        config.providers.retain(|p| p.name != name);
        removed || before != config.providers.len()
    }

    /// Apply a partial update to a live provider and the configuration.
    pub async fn update_provider_config(
        &self,
        name: &str,
        update: ProviderConfigUpdate,
    ) -> Result<ProviderConfig> {
        let updated = self.registry.update_provider_config(name, &update).await?;
        if let Some(entry) = self
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .provider_mut(name)
        {
            *entry = updated.clone();
        }
        Ok(updated)
    }

    /// Registry probe results, a fresh health report and retry metrics.
    pub async fn get_system_health(&self) -> SystemHealth {
        let registry = self.registry.check_all_health().await;
        let health = self.health.check_all_providers().await;

        SystemHealth {
            state: self.state(),
            status: health.status,
            registry,
            health,
            retry: self.retry.metrics(),
        }
    }

    /// Stop monitoring and shut every provider down. A second call does
    /// nothing.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, SystemState::ShuttingDown | SystemState::Stopped) {
                debug!("AI system already {}", *state);
                return;
            }
            *state = SystemState::ShuttingDown;
        }
        info!("Shutting down AI system");

        self.health.stop_monitoring();
        self.registry.stop_health_monitoring();
        self.registry.cancel_recoveries();

        for name in self.registry.provider_names().await {
            self.registry.remove_provider(&name).await;
            self.health.forget_provider(&name);
        }

        self.set_state(SystemState::Stopped);
        self.events.publish(AiEvent::Shutdown);
        self.stop_forwarders();
        info!("AI system stopped");
    }
}

/// Providers brought up by one `initialize` call.
#[derive(Debug, Default)]
struct Startup {
    /// Every provider live after startup, in registration order.
    providers: Vec<String>,
    /// Providers this startup added itself and must undo on failure.
    added: Vec<String>,
}

impl Drop for AiSystem {
    fn drop(&mut self) {
        self.stop_forwarders();
    }
}

#[allow(unused_mut)]
fn builtin_factories() -> Vec<(ProviderKind, Arc<dyn ProviderFactory>)> {
    let mut factories: Vec<(ProviderKind, Arc<dyn ProviderFactory>)> = Vec::new();
    #[cfg(feature = "local")]
    factories.push((
        ProviderKind::LocalModelRunner,
        Arc::new(crate::providers::LocalModelRunnerFactory) as Arc<dyn ProviderFactory>,
    ));
    #[cfg(feature = "cloud")]
    factories.push((
        ProviderKind::CloudApi,
        Arc::new(crate::providers::CloudApiFactory) as Arc<dyn ProviderFactory>,
    ));
    factories
}

/// Re-publish one component's events on the system bus.
fn forward<T>(source: &EventBus<T>, sink: EventBus<AiEvent>) -> JoinHandle<()>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    AiEvent: From<T>,
{
    let mut rx = source.subscribe();
    let bus = source.name();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => sink.publish(AiEvent::from(envelope.payload)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} events from the {} bus", skipped, bus);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
