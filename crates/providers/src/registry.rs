//! Provider registry - factories, live providers and basic health
//!
//! The registry is the single source of truth for which providers exist. It
//! owns each provider together with its last known health flag and a
//! semaphore bounding concurrent requests, runs the periodic health sweep and
//! performs automatic recovery after provider errors.

use chrono::{DateTime, Utc};
use common::EventBus;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, ProviderConfigUpdate, ProviderKind};
use crate::error::{ProviderError, Result};
use crate::events::RegistryEvent;
use crate::provider::{Provider, ProviderFactory};

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Period of the background health sweep
    #[serde(rename = "health_check_interval_ms", with = "crate::config::duration_ms")]
    pub health_check_interval: Duration,
    /// Deadline for a single provider health probe
    #[serde(rename = "health_check_timeout_ms", with = "crate::config::duration_ms")]
    pub health_check_timeout: Duration,
    /// Recovery attempts after a provider error
    pub max_retries: u32,
    /// Base pause before a recovery attempt, multiplied by the attempt number
    #[serde(rename = "retry_delay_ms", with = "crate::config::duration_ms")]
    pub retry_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Result of a single provider probe during a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: ProviderKind,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Outcome of [`ProviderRegistry::check_all_health`].
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// In registration order
    pub providers: Vec<ProviderStatus>,
    pub checked_at: DateTime<Utc>,
}

impl RegistryStatus {
    pub fn is_healthy(&self, name: &str) -> bool {
        self.providers
            .iter()
            .any(|p| p.name == name && p.healthy)
    }

    pub fn first_healthy(&self) -> Option<&str> {
        self.providers
            .iter()
            .find(|p| p.healthy)
            .map(|p| p.name.as_str())
    }
}

#[derive(Clone)]
struct ProviderEntry {
    provider: Arc<dyn Provider>,
    kind: ProviderKind,
    healthy: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
}

#[derive(Default)]
struct ProviderTable {
    entries: HashMap<String, ProviderEntry>,
    /// Registration order
    order: Vec<String>,
}

/// Thread-safe registry of provider factories and live providers.
pub struct ProviderRegistry {
    config: RegistryConfig,
    factories: RwLock<HashMap<ProviderKind, Arc<dyn ProviderFactory>>>,
    providers: RwLock<ProviderTable>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    recoveries: Mutex<HashMap<String, JoinHandle<()>>>,
    events: EventBus<RegistryEvent>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ProviderRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        debug!("Creating provider registry with config: {:?}", config);
        Self {
            config,
            factories: RwLock::new(HashMap::new()),
            providers: RwLock::new(ProviderTable::default()),
            monitor: Mutex::new(None),
            recoveries: Mutex::new(HashMap::new()),
            events: EventBus::new("registry", 256),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<RegistryEvent> {
        &self.events
    }

    /// Register `factory` for every kind in `kinds`.
    ///
    /// Nothing is registered if any of the kinds already has a factory.
    pub async fn register_factory(
        &self,
        factory: Arc<dyn ProviderFactory>,
        kinds: &[ProviderKind],
    ) -> Result<()> {
        let mut factories = self.factories.write().await;
        if let Some(taken) = kinds.iter().find(|k| factories.contains_key(k)) {
            return Err(ProviderError::DuplicateFactory(*taken));
        }
        for kind in kinds {
            factories.insert(*kind, Arc::clone(&factory));
        }
        debug!("Registered factory for {:?}", kinds);
        Ok(())
    }

    pub async fn has_factory(&self, kind: ProviderKind) -> bool {
        self.factories.read().await.contains_key(&kind)
    }

    /// Construct a provider and register it without initializing it.
    pub async fn create_provider(
        &self,
        name: &str,
        kind: ProviderKind,
        mut config: ProviderConfig,
    ) -> Result<Arc<dyn Provider>> {
        let factory = self
            .factories
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or(ProviderError::UnknownFactoryType(kind))?;

        if self.has_provider(name).await {
            return Err(ProviderError::DuplicateProviderName(name.to_string()));
        }

        config.name = name.to_string();
        let max_concurrent = config.max_concurrent_requests.max(1);
        let provider = factory
            .create(name, config)
            .map_err(|e| ProviderError::for_provider(name, e))?;

        let mut table = self.providers.write().await;
        if table.entries.contains_key(name) {
            return Err(ProviderError::DuplicateProviderName(name.to_string()));
        }
        table.entries.insert(
            name.to_string(),
            ProviderEntry {
                provider: Arc::clone(&provider),
                kind,
                healthy: Arc::new(AtomicBool::new(true)),
                permits: Arc::new(Semaphore::new(max_concurrent)),
            },
        );
        table.order.push(name.to_string());
        debug!(provider = name, "Created {} provider", kind);
        Ok(provider)
    }

    /// Create and initialize a provider.
    ///
    /// A provider that fails to initialize is removed again and the error is
    /// returned with the provider name attached.
    pub async fn add_provider(
        &self,
        name: &str,
        kind: ProviderKind,
        config: ProviderConfig,
    ) -> Result<Arc<dyn Provider>> {
        let provider = self.create_provider(name, kind, config).await?;

        if let Err(e) = provider.initialize().await {
            warn!(provider = name, "Initialization failed, rolling back: {}", e);
            self.detach(name).await;
            return Err(ProviderError::for_provider(name, e));
        }
        if !self.has_provider(name).await {
            warn!(provider = name, "Removed while initializing");
            return Err(ProviderError::ProviderNotFound(name.to_string()));
        }

        info!(provider = name, "Added {} provider", kind);
        self.events.publish(RegistryEvent::ProviderAdded {
            provider: name.to_string(),
            kind,
        });
        Ok(provider)
    }

    /// Remove a provider, running its cleanup on a best-effort basis.
    ///
    /// Returns `false` if no provider with this name exists.
    pub async fn remove_provider(&self, name: &str) -> bool {
        let Some(entry) = self.detach(name).await else {
            return false;
        };

        if let Some(handle) = self.lock_recoveries().remove(name) {
            handle.abort();
        }
        match tokio::time::timeout(self.config.health_check_timeout, entry.provider.cleanup()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(provider = name, "Cleanup failed: {}", e),
            Err(_) => warn!(
                provider = name,
                "Cleanup timed out after {:?}", self.config.health_check_timeout
            ),
        }

        info!(provider = name, "Removed provider");
        self.events.publish(RegistryEvent::ProviderRemoved {
            provider: name.to_string(),
        });
        true
    }

    async fn detach(&self, name: &str) -> Option<ProviderEntry> {
        let mut table = self.providers.write().await;
        let entry = table.entries.remove(name)?;
        table.order.retain(|n| n != name);
        Some(entry)
    }

    async fn entry(&self, name: &str) -> Option<ProviderEntry> {
        self.providers.read().await.entries.get(name).cloned()
    }

    pub async fn get_provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.entry(name).await.map(|e| e.provider)
    }

    /// All providers in registration order.
    pub async fn get_all_providers(&self) -> Vec<Arc<dyn Provider>> {
        let table = self.providers.read().await;
        table
            .order
            .iter()
            .filter_map(|name| table.entries.get(name))
            .map(|e| Arc::clone(&e.provider))
            .collect()
    }

    pub async fn provider_names(&self) -> Vec<String> {
        self.providers.read().await.order.clone()
    }

    pub async fn has_provider(&self, name: &str) -> bool {
        self.providers.read().await.entries.contains_key(name)
    }

    /// Health flag from the most recent probe; `None` for unknown providers.
    pub async fn last_known_healthy(&self, name: &str) -> Option<bool> {
        self.entry(name)
            .await
            .map(|e| e.healthy.load(Ordering::SeqCst))
    }

    /// Wait for a request slot on the named provider.
    pub async fn acquire_permit(&self, name: &str) -> Result<OwnedSemaphorePermit> {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| ProviderError::ProviderNotFound(name.to_string()))?;
        entry
            .permits
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::ProviderNotFound(name.to_string()))
    }

    /// Apply a configuration update to a live provider.
    pub async fn update_provider_config(
        &self,
        name: &str,
        update: &ProviderConfigUpdate,
    ) -> Result<ProviderConfig> {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| ProviderError::ProviderNotFound(name.to_string()))?;
        entry
            .provider
            .update_config(update)
            .await
            .map_err(|e| ProviderError::for_provider(name, e))?;

        if let Some(max) = update.max_concurrent_requests {
            // Permits held on the old semaphore stay valid until released.
            let mut table = self.providers.write().await;
            if let Some(entry) = table.entries.get_mut(name) {
                entry.permits = Arc::new(Semaphore::new(max.max(1)));
            }
        }
        Ok(entry.provider.config())
    }

    /// Probe one provider and record the result on its entry.
    async fn probe(&self, name: &str, entry: &ProviderEntry) -> ProviderStatus {
        let start = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.health_check_timeout, entry.provider.health_check())
                .await;

        let (healthy, error) = match outcome {
            Ok(Ok(true)) => (true, None),
            Ok(Ok(false)) => (false, Some("health check reported unhealthy".to_string())),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (
                false,
                Some(ProviderError::timeout(self.config.health_check_timeout).to_string()),
            ),
        };
        entry.healthy.store(healthy, Ordering::SeqCst);
        debug!(
            provider = name,
            healthy,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Health probe finished"
        );

        ProviderStatus {
            name: name.to_string(),
            kind: entry.kind,
            healthy,
            error,
        }
    }

    /// Run every provider's own health check concurrently.
    pub async fn check_all_health(&self) -> RegistryStatus {
        let snapshot: Vec<(String, ProviderEntry)> = {
            let table = self.providers.read().await;
            table
                .order
                .iter()
                .filter_map(|name| table.entries.get(name).map(|e| (name.clone(), e.clone())))
                .collect()
        };

        let providers = join_all(
            snapshot
                .iter()
                .map(|(name, entry)| self.probe(name, entry)),
        )
        .await;

        for status in providers.iter().filter(|s| !s.healthy) {
            warn!(
                provider = %status.name,
                "Provider unhealthy: {}",
                status.error.as_deref().unwrap_or("unknown error")
            );
            self.events.publish(RegistryEvent::ProviderUnhealthy {
                provider: status.name.clone(),
            });
        }

        let healthy = providers.iter().filter(|s| s.healthy).count();
        let status = RegistryStatus {
            total: providers.len(),
            healthy,
            unhealthy: providers.len() - healthy,
            providers,
            checked_at: Utc::now(),
        };
        self.events.publish(RegistryEvent::HealthSweepComplete {
            total: status.total,
            healthy: status.healthy,
            unhealthy: status.unhealthy,
        });
        status
    }

    /// Pick a provider that is healthy right now.
    ///
    /// Preferred names are tried in order, then the first healthy provider in
    /// registration order.
    pub async fn get_healthy_provider(&self, preferred: &[&str]) -> Option<Arc<dyn Provider>> {
        let status = self.check_all_health().await;

        let chosen = preferred
            .iter()
            .copied()
            .find(|name| status.is_healthy(name))
            .or_else(|| status.first_healthy())?;
        debug!("Selected provider '{}'", chosen);
        self.get_provider(chosen).await
    }

    /// Start the periodic health sweep, replacing any running one.
    pub fn start_health_monitoring(self: &Arc<Self>, interval: Option<Duration>) {
        self.stop_health_monitoring();

        let period = interval
            .unwrap_or(self.config.health_check_interval)
            .max(Duration::from_millis(1));
        let registry = Arc::downgrade(self);
        info!("Starting registry health monitoring every {:?}", period);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let status = registry.check_all_health().await;
                for unhealthy in status.providers.iter().filter(|p| !p.healthy) {
                    registry.schedule_recovery(&unhealthy.name);
                }
            }
        });

        *self.lock_monitor() = Some(handle);
    }

    pub fn stop_health_monitoring(&self) {
        if let Some(handle) = self.lock_monitor().take() {
            handle.abort();
            info!("Stopped registry health monitoring");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_monitor().is_some()
    }

    /// Record a provider failure and start automatic recovery for it.
    pub fn report_provider_error(self: &Arc<Self>, name: &str, error: &ProviderError) {
        warn!(provider = name, "Provider error reported: {}", error);
        self.events.publish(RegistryEvent::ProviderError {
            provider: name.to_string(),
            kind: error.kind(),
            error: error.to_string(),
        });
        self.schedule_recovery(name);
    }

    /// Abort every in-flight recovery.
    pub fn cancel_recoveries(&self) {
        for (_, handle) in self.lock_recoveries().drain() {
            handle.abort();
        }
    }

    fn schedule_recovery(self: &Arc<Self>, name: &str) {
        let mut recoveries = self.lock_recoveries();
        if recoveries.get(name).is_some_and(|h| !h.is_finished()) {
            debug!(provider = name, "Recovery already in progress");
            return;
        }

        let registry = Arc::downgrade(self);
        let provider = name.to_string();
        let handle = tokio::spawn(async move {
            Self::recover(registry.clone(), &provider).await;
            if let Some(registry) = registry.upgrade() {
                registry.lock_recoveries().remove(&provider);
            }
        });
        recoveries.insert(name.to_string(), handle);
    }

    /// Up to `max_retries` probes, the n-th after a pause of `retry_delay * n`.
    async fn recover(registry: Weak<Self>, name: &str) {
        let (max_retries, retry_delay) = match registry.upgrade() {
            Some(r) => (r.config.max_retries, r.config.retry_delay),
            None => return,
        };

        for attempt in 1..=max_retries {
            tokio::time::sleep(retry_delay * attempt).await;

            let Some(registry) = registry.upgrade() else {
                return;
            };
            let Some(entry) = registry.entry(name).await else {
                debug!(provider = name, "Provider removed during recovery");
                return;
            };

            let status = registry.probe(name, &entry).await;
            if status.healthy {
                info!(provider = name, attempt, "Provider recovered");
                registry.events.publish(RegistryEvent::ProviderRecovered {
                    provider: name.to_string(),
                    attempt,
                });
                return;
            }
            debug!(provider = name, attempt, "Recovery attempt failed");
        }

        if let Some(registry) = registry.upgrade() {
            warn!(provider = name, "Recovery failed after {} attempts", max_retries);
            registry.events.publish(RegistryEvent::ProviderRecoveryFailed {
                provider: name.to_string(),
                attempts: max_retries,
            });
        }
    }

    fn lock_monitor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_recoveries(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.recoveries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProviderRegistry {
    fn drop(&mut self) {
        self.stop_health_monitoring();
        self.cancel_recoveries();
    }
}
