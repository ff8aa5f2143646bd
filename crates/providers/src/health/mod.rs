//! Health checking system for providers
//!
//! Runs a suite of checks (connectivity, model availability, a real test
//! generation and any registered custom checks) against every provider in the
//! registry, keeps running [`HealthMetrics`] per provider and derives provider
//! and system level [`HealthStatus`].

use chrono::{DateTime, Utc};
use common::EventBus;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProviderError, Result};
use crate::events::{HealthEvent, RegistryEvent};
use crate::registry::ProviderRegistry;

pub mod checks;
mod metrics;

pub use checks::{
    CheckResult, ConnectivityCheck, HealthCheck, ModelAvailabilityCheck, ResponseTestCheck,
};
pub use metrics::{HealthMetrics, RATE_WINDOW};

/// Health monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckerConfig {
    /// Period of each provider's check cycle
    #[serde(rename = "check_interval_ms", with = "crate::config::duration_ms")]
    pub check_interval: Duration,
    /// Default deadline for a single check
    #[serde(rename = "check_timeout_ms", with = "crate::config::duration_ms")]
    pub check_timeout: Duration,
    #[serde(rename = "response_test_timeout_ms", with = "crate::config::duration_ms")]
    pub response_test_timeout: Duration,
    pub response_test_prompt: String,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
            response_test_timeout: Duration::from_secs(30),
            response_test_prompt: "Respond with OK.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Status implied by a set of check results.
    pub fn from_checks<'a>(results: impl IntoIterator<Item = &'a CheckResult>) -> Self {
        let mut status = HealthStatus::Healthy;
        for result in results {
            if result.passed {
                continue;
            }
            if result.critical {
                return HealthStatus::Unhealthy;
            }
            status = HealthStatus::Degraded;
        }
        status
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot produced by one check cycle of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealthReport {
    pub provider: String,
    pub status: HealthStatus,
    pub overall_passed: bool,
    pub checks: HashMap<String, CheckResult>,
    pub metrics: HealthMetrics,
    /// Set when the cycle itself could not run
    pub error: Option<String>,
    pub last_check: DateTime<Utc>,
    pub next_check: Option<DateTime<Utc>>,
}

impl ProviderHealthReport {
    fn unknown(provider: &str, error: String, metrics: HealthMetrics) -> Self {
        Self {
            provider: provider.to_string(),
            status: HealthStatus::Unknown,
            overall_passed: false,
            checks: HashMap::new(),
            metrics,
            error: Some(error),
            last_check: Utc::now(),
            next_check: None,
        }
    }

    pub fn failed_checks(&self) -> Vec<String> {
        let mut failed: Vec<String> = self
            .checks
            .values()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect();
        failed.sort();
        failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealthReport {
    pub status: HealthStatus,
    pub providers: Vec<ProviderHealthReport>,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub timestamp: DateTime<Utc>,
}

impl SystemHealthReport {
    pub fn from_reports(providers: Vec<ProviderHealthReport>) -> Self {
        let count = |s: HealthStatus| providers.iter().filter(|r| r.status == s).count();
        let (healthy, degraded, unhealthy, unknown) = (
            count(HealthStatus::Healthy),
            count(HealthStatus::Degraded),
            count(HealthStatus::Unhealthy),
            count(HealthStatus::Unknown),
        );

        let status = if providers.is_empty() || unhealthy > 0 {
            HealthStatus::Unhealthy
        } else if degraded > 0 || unknown > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            total: providers.len(),
            providers,
            healthy,
            degraded,
            unhealthy,
            unknown,
            timestamp: Utc::now(),
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderHealthReport> {
        self.providers.iter().find(|r| r.provider == name)
    }
}

type SharedMetrics = Arc<Mutex<HealthMetrics>>;

/// Multi-check health assessment over the providers of a registry.
pub struct HealthChecker {
    registry: Arc<ProviderRegistry>,
    config: HealthCheckerConfig,
    builtin_checks: Vec<Arc<dyn HealthCheck>>,
    custom_checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    metrics: Mutex<HashMap<String, SharedMetrics>>,
    reports: RwLock<HashMap<String, ProviderHealthReport>>,
    system_report: RwLock<Option<SystemHealthReport>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    monitoring: AtomicBool,
    events: EventBus<HealthEvent>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("monitoring", &self.is_monitoring())
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(registry: Arc<ProviderRegistry>, config: HealthCheckerConfig) -> Self {
        let builtin_checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(ConnectivityCheck),
            Arc::new(ModelAvailabilityCheck),
            Arc::new(ResponseTestCheck::new(
                config.response_test_prompt.clone(),
                config.response_test_timeout,
            )),
        ];

        Self {
            registry,
            config,
            builtin_checks,
            custom_checks: RwLock::new(Vec::new()),
            metrics: Mutex::new(HashMap::new()),
            reports: RwLock::new(HashMap::new()),
            system_report: RwLock::new(None),
            timers: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            monitoring: AtomicBool::new(false),
            events: EventBus::new("health", 256),
        }
    }

    pub fn config(&self) -> &HealthCheckerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<HealthEvent> {
        &self.events
    }

    /// Register a check that runs on every cycle, replacing one of the same name.
    pub fn add_custom_check(&self, check: Arc<dyn HealthCheck>) {
        let mut checks = self
            .custom_checks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        checks.retain(|c| c.name() != check.name());
        debug!("Added custom health check '{}'", check.name());
        checks.push(check);
    }

    pub fn remove_custom_check(&self, name: &str) -> bool {
        let mut checks = self
            .custom_checks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = checks.len();
        checks.retain(|c| c.name() != name);
        before != checks.len()
    }

    fn all_checks(&self) -> Vec<Arc<dyn HealthCheck>> {
        let custom = self
            .custom_checks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.builtin_checks
            .iter()
            .chain(custom.iter())
            .cloned()
            .collect()
    }

    fn metrics_cell(&self, provider: &str) -> SharedMetrics {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(metrics.entry(provider.to_string()).or_default())
    }

    /// Fold one sample into a provider's metrics.
    fn record_sample(&self, provider: &str, response_time: Duration, success: bool) -> HealthMetrics {
        let cell = self.metrics_cell(provider);
        let mut metrics = cell.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.record(response_time, success);
        metrics.clone()
    }

    /// Start keeping metrics for a provider. Does nothing if it is already
    /// tracked.
    pub fn track_provider(&self, provider: &str) {
        self.metrics_cell(provider);
    }

    /// Record the outcome of a generation request.
    ///
    /// Samples for providers that are not tracked (never added, or already
    /// removed) are dropped.
    pub fn record_request(&self, provider: &str, response_time: Duration, success: bool) {
        let cell = self
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned();
        match cell {
            Some(cell) => cell
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(response_time, success),
            None => debug!(provider = provider, "Dropping sample for untracked provider"),
        }
    }

    pub fn metrics(&self, provider: &str) -> Option<HealthMetrics> {
        let cell = self
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()?;
        let metrics = cell.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(metrics)
    }

    pub fn all_metrics(&self) -> HashMap<String, HealthMetrics> {
        let cells: Vec<(String, SharedMetrics)> = self
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        cells
            .into_iter()
            .map(|(name, cell)| {
                let metrics = cell.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (name, metrics)
            })
            .collect()
    }

    pub fn last_report(&self, provider: &str) -> Option<ProviderHealthReport> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
    }

    pub fn last_system_report(&self) -> Option<SystemHealthReport> {
        self.system_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every check against one provider.
    ///
    /// Failing checks become failed results; only an unknown provider name
    /// is an error.
    pub async fn check_provider_health(&self, name: &str) -> Result<ProviderHealthReport> {
        let provider = self
            .registry
            .get_provider(name)
            .await
            .ok_or_else(|| ProviderError::ProviderNotFound(name.to_string()))?;

        let start = Instant::now();
        let suite = self.all_checks();
        let results = join_all(
            suite
                .iter()
                .map(|check| checks::run_check(check.as_ref(), provider.as_ref(), self.config.check_timeout)),
        )
        .await;

        let status = HealthStatus::from_checks(&results);
        let metrics = self.record_sample(name, start.elapsed(), status == HealthStatus::Healthy);
        let now = Utc::now();
        let next_check = self
            .is_provider_monitored(name)
            .then(|| chrono::Duration::from_std(self.config.check_interval).ok())
            .flatten()
            .map(|interval| now + interval);

        let report = ProviderHealthReport {
            provider: name.to_string(),
            status,
            overall_passed: results.iter().all(|r| r.passed),
            checks: results.into_iter().map(|r| (r.name.clone(), r)).collect(),
            metrics,
            error: None,
            last_check: now,
            next_check,
        };

        if self.registry.has_provider(name).await {
            self.reports
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), report.clone());
        } else {
            self.forget_provider(name);
        }

        self.publish_report(&report);
        Ok(report)
    }

    fn publish_report(&self, report: &ProviderHealthReport) {
        debug!(
            provider = %report.provider,
            status = %report.status,
            "Health check complete"
        );
        self.events.publish(HealthEvent::HealthCheckComplete {
            provider: report.provider.clone(),
            status: report.status,
            overall_passed: report.overall_passed,
        });
        if report.status != HealthStatus::Healthy {
            warn!(
                provider = %report.provider,
                "Provider is {}: {:?}",
                report.status,
                report.failed_checks()
            );
            self.events.publish(HealthEvent::ProviderUnhealthy {
                provider: report.provider.clone(),
                status: report.status,
                failed_checks: report.failed_checks(),
            });
        }
    }

    /// Check every registered provider and derive the system status.
    ///
    /// Each provider's cycle runs in its own task, so a cycle that fails or
    /// panics yields an `Unknown` report for that provider only.
    pub async fn check_all_providers(self: &Arc<Self>) -> SystemHealthReport {
        let names = self.registry.provider_names().await;

        let tasks: Vec<(String, JoinHandle<Result<ProviderHealthReport>>)> = names
            .into_iter()
            .map(|name| {
                let checker = Arc::clone(self);
                let task_name = name.clone();
                let handle =
                    tokio::spawn(async move { checker.check_provider_health(&task_name).await });
                (name, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(tasks.len());
        for (name, handle) in tasks {
            let failure = match handle.await {
                Ok(Ok(report)) => {
                    reports.push(report);
                    continue;
                }
                Ok(Err(ProviderError::ProviderNotFound(_))) => {
                    debug!(provider = %name, "Provider removed during health check");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(join_error) => format!("health check cycle aborted: {}", join_error),
            };

            error!(provider = %name, "Health check cycle failed: {}", failure);
            let metrics = self.metrics(&name).unwrap_or_default();
            let report = ProviderHealthReport::unknown(&name, failure, metrics);
            self.reports
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), report.clone());
            self.publish_report(&report);
            reports.push(report);
        }

        let system = SystemHealthReport::from_reports(reports);
        info!(
            status = %system.status,
            "System health: {} healthy, {} degraded, {} unhealthy, {} unknown",
            system.healthy,
            system.degraded,
            system.unhealthy,
            system.unknown
        );
        self.events.publish(HealthEvent::SystemHealthCheckComplete {
            status: system.status,
            total: system.total,
            healthy: system.healthy,
            degraded: system.degraded,
            unhealthy: system.unhealthy,
            unknown: system.unknown,
        });
        *self
            .system_report
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(system.clone());
        system
    }

    /// Monitor every registered provider, each on its own timer.
    ///
    /// Providers added to the registry later are picked up automatically
    /// while monitoring is active.
    pub async fn start_monitoring(self: &Arc<Self>) {
        self.monitoring.store(true, Ordering::SeqCst);
        self.ensure_listener();
        let names = self.registry.provider_names().await;
        info!("Starting health monitoring for {} providers", names.len());
        for name in names {
            self.start_provider_monitoring(&name);
        }
    }

    /// Start (or restart) the check timer of one provider. The first check
    /// runs immediately.
    pub fn start_provider_monitoring(self: &Arc<Self>, name: &str) {
        self.ensure_listener();
        self.stop_provider_monitoring(name);

        let checker = Arc::downgrade(self);
        let provider = name.to_string();
        let period = self.config.check_interval.max(Duration::from_millis(1));
        let (registered, wait_registered) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            // The first report must see this timer in `timers`.
            if wait_registered.await.is_err() {
                return;
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(checker) = checker.upgrade() else {
                    break;
                };
                if let Err(ProviderError::ProviderNotFound(_)) =
                    checker.check_provider_health(&provider).await
                {
                    debug!(provider = %provider, "Provider gone, stopping its monitor");
                    break;
                }
            }
        });

        debug!(provider = name, "Started health monitoring every {:?}", period);
        self.lock_timers().insert(name.to_string(), handle);
        let _ = registered.send(());
    }

    pub fn stop_provider_monitoring(&self, name: &str) -> bool {
        match self.lock_timers().remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every timer. Safe to call repeatedly.
    pub fn stop_monitoring(&self) {
        let was_monitoring = self.monitoring.swap(false, Ordering::SeqCst);
        for (_, handle) in self.lock_timers().drain() {
            handle.abort();
        }
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if was_monitoring {
            info!("Stopped health monitoring");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    pub fn is_provider_monitored(&self, name: &str) -> bool {
        self.lock_timers().contains_key(name)
    }

    /// Drop timers, metrics and reports of a provider.
    pub fn forget_provider(&self, name: &str) {
        self.stop_provider_monitoring(name);
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.reports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        debug!(provider = name, "Dropped health state");
    }

    /// Follow registry membership changes.
    fn ensure_listener(self: &Arc<Self>) {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut rx = self.registry.events().subscribe();
        let checker = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(envelope) => envelope.payload,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Health listener skipped {} registry events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(checker) = checker.upgrade() else {
                    break;
                };
                match event {
                    RegistryEvent::ProviderRemoved { provider } => checker.forget_provider(&provider),
                    RegistryEvent::ProviderAdded { provider, .. } => {
                        checker.track_provider(&provider);
                        if checker.is_monitoring() {
                            checker.start_provider_monitoring(&provider);
                        }
                    }
                    _ => {}
                }
            }
        }));
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}
