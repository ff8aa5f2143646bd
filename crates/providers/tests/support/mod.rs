#![allow(dead_code)]

use async_trait::async_trait;
use common::EventEnvelope;
use futures::stream::{self, StreamExt};
use providers::{
    AiSystemConfig, Capabilities, Capability, GenerationRequest, GenerationResponse,
    HealthCheckerConfig, Provider, ProviderConfig, ProviderConfigUpdate, ProviderError,
    ProviderFactory, ProviderKind, ProviderSettings, RegistryConfig, Result, RetryConfig,
    TextStream, TokenUsage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};

/// Prompt used by the response-test health check in these tests. Mock
/// providers do not count it as a request and never apply scripted failures
/// to it.
pub const PROBE_PROMPT: &str = "health-probe";

/// Scriptable in-memory provider.
pub struct MockProvider {
    name: String,
    kind: ProviderKind,
    config: RwLock<ProviderConfig>,
    healthy: AtomicBool,
    fail_initialize: AtomicBool,
    panic_on_list_models: AtomicBool,
    scripted_failures: Mutex<VecDeque<ProviderError>>,
    always_fail: Mutex<Option<ProviderError>>,
    models: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    initialize_delay: Mutex<Duration>,
    stream_open_delay: Mutex<Duration>,
    cleanup_delay: Mutex<Duration>,
    stream_chunks: Mutex<Vec<Result<String>>>,
    endless_stream: AtomicBool,
    generate_calls: AtomicU32,
    health_checks: AtomicU32,
    cleanups: AtomicU32,
}

impl MockProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_kind(name, ProviderKind::Custom)
    }

    pub fn with_kind(name: &str, kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            config: RwLock::new(mock_config(name)),
            healthy: AtomicBool::new(true),
            fail_initialize: AtomicBool::new(false),
            panic_on_list_models: AtomicBool::new(false),
            scripted_failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            models: Mutex::new(vec!["mock-model".to_string()]),
            delay: Mutex::new(Duration::ZERO),
            initialize_delay: Mutex::new(Duration::ZERO),
            stream_open_delay: Mutex::new(Duration::ZERO),
            cleanup_delay: Mutex::new(Duration::ZERO),
            stream_chunks: Mutex::new(vec![
                Ok("Hello".to_string()),
                Ok(", ".to_string()),
                Ok("world".to_string()),
            ]),
            endless_stream: AtomicBool::new(false),
            generate_calls: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_list_models(&self) {
        self.panic_on_list_models.store(true, Ordering::SeqCst);
    }

    /// Fail the next generation with `error`; scripted failures are consumed
    /// in order.
    pub fn fail_next(&self, error: ProviderError) {
        self.scripted_failures.lock().unwrap().push_back(error);
    }

    /// Fail every generation, probes included, until cleared.
    pub fn fail_always(&self, error: ProviderError) {
        *self.always_fail.lock().unwrap() = Some(error);
    }

    pub fn clear_failures(&self) {
        self.scripted_failures.lock().unwrap().clear();
        *self.always_fail.lock().unwrap() = None;
    }

    pub fn set_models(&self, models: Vec<String>) {
        *self.models.lock().unwrap() = models;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_initialize_delay(&self, delay: Duration) {
        *self.initialize_delay.lock().unwrap() = delay;
    }

    /// Delay before `generate_stream` hands out its stream.
    pub fn set_stream_open_delay(&self, delay: Duration) {
        *self.stream_open_delay.lock().unwrap() = delay;
    }

    pub fn set_cleanup_delay(&self, delay: Duration) {
        *self.cleanup_delay.lock().unwrap() = delay;
    }

    pub fn set_stream(&self, chunks: Vec<Result<String>>) {
        *self.stream_chunks.lock().unwrap() = chunks;
    }

    /// Stream numbered chunks forever, one every few milliseconds.
    pub fn stream_forever(&self) {
        self.endless_stream.store(true, Ordering::SeqCst);
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }

    fn set_config(&self, config: ProviderConfig) {
        *self.config.write().unwrap() = config;
    }

    fn next_failure(&self, probe: bool) -> Option<ProviderError> {
        if let Some(error) = self.always_fail.lock().unwrap().clone() {
            return Some(error);
        }
        if probe {
            return None;
        }
        self.scripted_failures.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        [Capability::Generation, Capability::Streaming, Capability::ModelListing]
            .into_iter()
            .collect()
    }

    fn config(&self) -> ProviderConfig {
        self.config.read().unwrap().clone()
    }

    async fn update_config(&self, update: &ProviderConfigUpdate) -> Result<()> {
        let next = self.config().apply(update);
        next.validate()?;
        self.set_config(next);
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let delay = *self.initialize_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(ProviderError::Network(format!(
                "{} refused the connection",
                self.name
            )));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        let delay = *self.cleanup_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        if self.panic_on_list_models.load(Ordering::SeqCst) {
            panic!("{} blew up while listing models", self.name);
        }
        Ok(self.models.lock().unwrap().clone())
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let probe = request.prompt == PROBE_PROMPT;
        if !probe {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.next_failure(probe) {
            return Err(error);
        }

        let content = format!("{} says hi", self.name);
        Ok(GenerationResponse {
            usage: TokenUsage::estimate(&request.prompt, &content),
            content,
            model: request.model.unwrap_or_else(|| "mock-model".to_string()),
            provider: self.name.clone(),
            finish_reason: Some("stop".to_string()),
            response_time: delay,
        })
    }

    async fn generate_stream(&self, _request: GenerationRequest) -> Result<TextStream> {
        let delay = *self.stream_open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.next_failure(false) {
            return Err(error);
        }

        if self.endless_stream.load(Ordering::SeqCst) {
            let chunks = stream::iter(0u64..).then(|i| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, ProviderError>(format!("chunk {}", i))
            });
            return Ok(chunks.boxed());
        }

        let chunks = self.stream_chunks.lock().unwrap().clone();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Pre-built mocks handed out by name through a factory.
#[derive(Default)]
pub struct MockCatalog {
    mocks: Mutex<HashMap<String, Arc<MockProvider>>>,
    created: AtomicU32,
}

impl MockCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, mock: Arc<MockProvider>) -> Arc<MockProvider> {
        self.mocks
            .lock()
            .unwrap()
            .insert(mock.name().to_string(), Arc::clone(&mock));
        mock
    }

    pub fn get(&self, name: &str) -> Option<Arc<MockProvider>> {
        self.mocks.lock().unwrap().get(name).cloned()
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Factory returning the catalogued mock for a name, or a fresh healthy
    /// one when none was prepared.
    pub fn factory(self: &Arc<Self>) -> Arc<dyn ProviderFactory> {
        let catalog = Arc::clone(self);
        Arc::new(
            move |name: &str, config: ProviderConfig| -> Result<Arc<dyn Provider>> {
                catalog.created.fetch_add(1, Ordering::SeqCst);
                let mock = match catalog.get(name) {
                    Some(mock) => mock,
                    None => catalog.add(MockProvider::with_kind(name, config.kind())),
                };
                mock.set_config(config);
                Ok(mock)
            },
        )
    }
}

pub fn mock_config(name: &str) -> ProviderConfig {
    ProviderConfig::new(name, ProviderSettings::custom(format!("mem://{}", name)))
}

/// System configuration with short timings and no built-in providers.
pub fn test_system_config(providers: Vec<ProviderConfig>) -> AiSystemConfig {
    AiSystemConfig {
        environment: "test".to_string(),
        providers,
        routing: HashMap::new(),
        default_provider_kind: ProviderKind::LocalModelRunner,
        health: HealthCheckerConfig {
            check_interval: Duration::from_secs(60),
            check_timeout: Duration::from_millis(500),
            response_test_timeout: Duration::from_millis(500),
            response_test_prompt: PROBE_PROMPT.to_string(),
        },
        registry: RegistryConfig {
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_millis(500),
            max_retries: 2,
            retry_delay: Duration::from_millis(20),
        },
        retry: RetryConfig::fast().with_jitter(false),
    }
}

pub fn fast_registry_config() -> RegistryConfig {
    RegistryConfig {
        health_check_interval: Duration::from_millis(50),
        health_check_timeout: Duration::from_millis(200),
        max_retries: 3,
        retry_delay: Duration::from_millis(50),
    }
}

pub fn fast_health_config() -> HealthCheckerConfig {
    HealthCheckerConfig {
        check_interval: Duration::from_millis(50),
        check_timeout: Duration::from_millis(200),
        response_test_timeout: Duration::from_millis(200),
        response_test_prompt: PROBE_PROMPT.to_string(),
    }
}

/// Wait up to two seconds for an event matching `pred`.
pub async fn next_matching<T, F>(
    rx: &mut broadcast::Receiver<EventEnvelope<T>>,
    mut pred: F,
) -> Option<T>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
    F: FnMut(&T) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(envelope) if pred(&envelope.payload) => return Some(envelope.payload),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .ok()
        .flatten()
}

/// Drain whatever is already queued on `rx`.
pub fn drain<T>(rx: &mut broadcast::Receiver<EventEnvelope<T>>) -> Vec<T>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(envelope) => events.push(envelope.payload),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
