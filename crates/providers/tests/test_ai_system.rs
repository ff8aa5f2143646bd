mod support;

use futures::StreamExt;
use providers::{
    AiEvent, AiSystem, AiSystemConfig, ErrorKind, GenerationRequest, HealthStatus, ProviderConfig,
    ProviderConfigUpdate, ProviderError, ProviderKind, ProviderSettings, RegistryEvent,
    SystemState,
};
use std::sync::Arc;
use std::time::Duration;
use support::{drain, mock_config, next_matching, test_system_config, MockCatalog, MockProvider};

async fn register_mocks(system: &AiSystem, catalog: &Arc<MockCatalog>) {
    system
        .registry()
        .register_factory(
            catalog.factory(),
            &[ProviderKind::Custom, ProviderKind::LocalModelRunner],
        )
        .await
        .unwrap();
}

async fn start(catalog: &Arc<MockCatalog>, config: AiSystemConfig) -> AiSystem {
    let system = AiSystem::new(config);
    register_mocks(&system, catalog).await;
    system.initialize().await.unwrap();
    system
}

fn three_providers(default: &str) -> AiSystemConfig {
    let mut config = test_system_config(vec![
        mock_config("alpha"),
        mock_config("beta"),
        mock_config("gamma"),
    ]);
    config.routing.insert("test".into(), default.into());
    config
}

#[tokio::test]
async fn test_generate_happy_path() {
    let catalog = MockCatalog::new();
    let system = AiSystem::new(three_providers("alpha"));
    register_mocks(&system, &catalog).await;
    let mut events = system.subscribe();

    system.initialize().await.unwrap();
    assert_eq!(system.state(), SystemState::Ready);

    let response = system
        .generate(GenerationRequest::new("Say hi"))
        .await
        .unwrap();
    assert_eq!(response.provider, "alpha");
    assert_eq!(response.content, "alpha says hi");
    assert_eq!(catalog.get("alpha").unwrap().generate_calls(), 1);

    let emitted = drain(&mut events);
    assert_eq!(
        emitted.iter().find(|e| matches!(e, AiEvent::Initialized { .. })),
        Some(&AiEvent::Initialized {
            providers: vec!["alpha".into(), "beta".into(), "gamma".into()],
        })
    );
    let completions: Vec<&AiEvent> = emitted
        .iter()
        .filter(|e| matches!(e, AiEvent::GenerationComplete { .. }))
        .collect();
    assert_eq!(completions.len(), 1);
    match completions[0] {
        AiEvent::GenerationComplete {
            provider, model, ..
        } => {
            assert_eq!(provider, "alpha");
            assert_eq!(model, "mock-model");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let metrics = system.health_checker().metrics("alpha").unwrap();
    assert!(metrics.total_requests >= 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;

    system.initialize().await.unwrap();

    assert_eq!(catalog.created(), 3);
    assert_eq!(system.available_providers().await.len(), 3);
    system.shutdown().await;
}

#[tokio::test]
async fn test_generation_requires_a_ready_system() {
    let catalog = MockCatalog::new();
    let system = AiSystem::new(three_providers("alpha"));
    register_mocks(&system, &catalog).await;

    let err = system
        .generate(GenerationRequest::new("too early"))
        .await
        .unwrap_err();
    assert!(matches!(&err, ProviderError::NotInitialized(state) if state == "uninitialized"));
    let err = system
        .generate_stream(GenerationRequest::new("too early"))
        .await
        .err()
        .expect("streaming must fail too");
    assert!(matches!(err, ProviderError::NotInitialized(_)));

    system.initialize().await.unwrap();
    system.shutdown().await;

    let err = system
        .generate(GenerationRequest::new("too late"))
        .await
        .unwrap_err();
    assert!(matches!(&err, ProviderError::NotInitialized(state) if state == "stopped"));
}

#[tokio::test]
async fn test_selection_order() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("beta")).await;

    let chosen = system
        .generate(GenerationRequest::new("hi").prefer("gamma"))
        .await
        .unwrap();
    assert_eq!(chosen.provider, "gamma");

    let chosen = system.generate(GenerationRequest::new("hi")).await.unwrap();
    assert_eq!(chosen.provider, "beta");

    catalog.get("gamma").unwrap().set_healthy(false);
    let chosen = system
        .generate(GenerationRequest::new("hi").prefer("gamma"))
        .await
        .unwrap();
    assert_eq!(chosen.provider, "beta");

    catalog.get("beta").unwrap().set_healthy(false);
    let chosen = system.generate(GenerationRequest::new("hi")).await.unwrap();
    assert_eq!(chosen.provider, "alpha");

    catalog.get("alpha").unwrap().set_healthy(false);
    catalog.get("gamma").unwrap().set_healthy(true);
    let chosen = system.generate(GenerationRequest::new("hi")).await.unwrap();
    assert_eq!(chosen.provider, "gamma");
    system.shutdown().await;
}

#[tokio::test]
async fn test_priority_drives_registration_order() {
    let catalog = MockCatalog::new();
    let config = test_system_config(vec![
        mock_config("low"),
        mock_config("high").with_priority(10),
        mock_config("mid").with_priority(5),
    ]);
    let system = start(&catalog, config).await;

    assert_eq!(
        system.available_providers().await,
        vec!["high".to_string(), "mid".to_string(), "low".to_string()]
    );
    let chosen = system.generate(GenerationRequest::new("hi")).await.unwrap();
    assert_eq!(chosen.provider, "high");
    system.shutdown().await;
}

#[tokio::test]
async fn test_total_outage_fails_fast() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    for name in ["alpha", "beta", "gamma"] {
        catalog.get(name).unwrap().set_healthy(false);
    }

    let err = system
        .generate(GenerationRequest::new("anyone?"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
    assert_eq!(err.to_string(), "Provider unavailable: No healthy AI providers available");
    for name in ["alpha", "beta", "gamma"] {
        assert_eq!(catalog.get(name).unwrap().generate_calls(), 0);
    }
    system.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    let alpha = catalog.get("alpha").unwrap();
    alpha.fail_next(ProviderError::Network("connection reset".into()));
    alpha.fail_next(ProviderError::rate_limited("slow down", None));

    let response = system.generate(GenerationRequest::new("hi")).await.unwrap();

    assert_eq!(response.provider, "alpha");
    assert_eq!(alpha.generate_calls(), 3);
    let metrics = system.retry_executor().metrics();
    assert_eq!(metrics.total_retries, 2);
    assert_eq!(metrics.successful_operations, 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_terminal_failure_is_reported_once() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    let mut events = system.subscribe();
    let alpha = catalog.get("alpha").unwrap();
    alpha.fail_next(ProviderError::Authentication("bad key".into()));

    let err = system
        .generate(GenerationRequest::new("hi"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(err.provider(), Some("alpha"));
    assert_eq!(alpha.generate_calls(), 1);

    let reported = next_matching(&mut events, |e| {
        matches!(e, AiEvent::Registry(RegistryEvent::ProviderError { .. }))
    })
    .await;
    assert_eq!(
        reported,
        Some(AiEvent::Registry(RegistryEvent::ProviderError {
            provider: "alpha".into(),
            kind: ErrorKind::Authentication,
            error: "Authentication failed: bad key".into(),
        }))
    );
    let metrics = system.health_checker().metrics("alpha").unwrap();
    assert!(metrics.last_failure.is_some());
    system.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests_do_not_trigger_recovery() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    let mut events = system.subscribe();
    catalog
        .get("alpha")
        .unwrap()
        .fail_next(ProviderError::Validation("prompt too long".into()));

    let err = system
        .generate(GenerationRequest::new("hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let reported = tokio::time::timeout(
        Duration::from_millis(150),
        next_matching(&mut events, |e| {
            matches!(e, AiEvent::Registry(RegistryEvent::ProviderError { .. }))
        }),
    )
    .await;
    assert!(matches!(reported, Err(_) | Ok(None)));
    system.shutdown().await;
}

#[tokio::test]
async fn test_retry_events_reach_subscribers() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    let mut events = system.subscribe();
    catalog
        .get("alpha")
        .unwrap()
        .fail_next(ProviderError::timeout(Duration::from_secs(1)));

    system.generate(GenerationRequest::new("hi")).await.unwrap();

    let attempt = next_matching(&mut events, |e| {
        matches!(e, AiEvent::Retry(providers::RetryEvent::RetryAttempt { .. }))
    })
    .await;
    match attempt {
        Some(AiEvent::Retry(providers::RetryEvent::RetryAttempt {
            provider, attempt, ..
        })) => {
            assert_eq!(provider.as_deref(), Some("alpha"));
            assert_eq!(attempt, 2);
        }
        other => panic!("expected a retry attempt, got {:?}", other),
    }
    system.shutdown().await;
}

#[tokio::test]
async fn test_stream_delivers_chunks_in_order() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("beta")).await;

    let stream = system
        .generate_stream(GenerationRequest::new("stream please"))
        .await
        .unwrap();
    assert_eq!(stream.provider(), "beta");

    let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
    assert_eq!(chunks.concat(), "Hello, world");
    system.shutdown().await;
}

#[tokio::test]
async fn test_stream_error_ends_the_stream() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    catalog.get("alpha").unwrap().set_stream(vec![
        Ok("partial".into()),
        Err(ProviderError::Model("model unloaded".into())),
        Ok("never".into()),
    ]);

    let mut stream = system
        .generate_stream(GenerationRequest::new("hi"))
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Model);
    assert_eq!(err.provider(), Some("alpha"));
    assert!(stream.next().await.is_none());
    system.shutdown().await;
}

#[tokio::test]
async fn test_stopping_a_stream_releases_its_slot() {
    let catalog = MockCatalog::new();
    let config = test_system_config(vec![mock_config("alpha").with_max_concurrent_requests(1)]);
    let system = start(&catalog, config).await;
    catalog.get("alpha").unwrap().stream_forever();

    let mut stream = system
        .generate_stream(GenerationRequest::new("go on"))
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "chunk 0");
    assert_eq!(stream.next().await.unwrap().unwrap(), "chunk 1");

    stream.stop();
    stream.stop();
    assert!(stream.is_stopped());
    assert!(stream.next().await.is_none());

    // The single request slot is free again once the forwarder is gone.
    let response = tokio::time::timeout(
        Duration::from_secs(1),
        system.generate(GenerationRequest::new("hi")),
    )
    .await
    .expect("slot must be released")
    .unwrap();
    assert_eq!(response.provider, "alpha");
    system.shutdown().await;
}

#[tokio::test]
async fn test_local_runner_failure_is_tolerated() {
    let catalog = MockCatalog::new();
    catalog
        .add(MockProvider::with_kind("ollama", ProviderKind::LocalModelRunner))
        .fail_initialize();
    let mut config = test_system_config(vec![
        ProviderConfig::new("ollama", ProviderSettings::local("http://127.0.0.1:9")),
        mock_config("alpha"),
    ]);
    config.routing.insert("test".into(), "ollama".into());

    let system = start(&catalog, config).await;

    assert_eq!(system.state(), SystemState::Ready);
    assert_eq!(system.available_providers().await, vec!["alpha".to_string()]);
    assert!(!system.config().is_provider_enabled("ollama"));
    let response = system.generate(GenerationRequest::new("hi")).await.unwrap();
    assert_eq!(response.provider, "alpha");
    system.shutdown().await;
}

#[tokio::test]
async fn test_other_failures_abort_initialization() {
    let catalog = MockCatalog::new();
    let alpha = catalog.add(MockProvider::new("alpha"));
    catalog.add(MockProvider::new("beta")).fail_initialize();
    let config = test_system_config(vec![
        mock_config("alpha").with_priority(1),
        mock_config("beta"),
    ]);
    let system = AiSystem::new(config);
    register_mocks(&system, &catalog).await;
    let mut events = system.subscribe();

    let err = system.initialize().await.unwrap_err();

    assert_eq!(err.provider(), Some("beta"));
    assert_eq!(system.state(), SystemState::Uninitialized);
    assert!(system.available_providers().await.is_empty());
    assert_eq!(alpha.cleanups(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, AiEvent::InitializationFailed { .. })));
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_at_startup() {
    let config = test_system_config(vec![mock_config("twin"), mock_config("twin")]);
    let system = AiSystem::new(config);

    let err = system.initialize().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(system.state(), SystemState::Uninitialized);
}

#[tokio::test]
async fn test_runtime_provider_management_keeps_config_in_sync() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;

    system.add_provider(mock_config("delta")).await.unwrap();
    assert!(system.config().provider("delta").is_some());
    assert!(system.registry().has_provider("delta").await);

    let err = system
        .add_provider(mock_config("delta"))
        .await
        .err()
        .expect("duplicate names are rejected");
    assert!(matches!(err, ProviderError::DuplicateProviderName(_)));

    let updated = system
        .update_provider_config(
            "delta",
            ProviderConfigUpdate {
                timeout: Some(Duration::from_secs(5)),
                retries: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.timeout, Duration::from_secs(5));
    assert_eq!(system.config().provider("delta"), Some(&updated));

    assert!(system.remove_provider("delta").await);
    assert!(system.config().provider("delta").is_none());
    assert!(!system.registry().has_provider("delta").await);
    assert!(!system.remove_provider("delta").await);
    system.shutdown().await;
}

#[tokio::test]
async fn test_system_health_merges_all_views() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    catalog.get("gamma").unwrap().set_healthy(false);
    system.generate(GenerationRequest::new("hi")).await.unwrap();

    let health = system.get_system_health().await;

    assert_eq!(health.state, SystemState::Ready);
    assert_eq!(health.registry.total, 3);
    assert_eq!(health.registry.unhealthy, 1);
    assert_eq!(health.health.total, 3);
    assert_eq!(health.health.unhealthy, 1);
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.retry.successful_operations, 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let catalog = MockCatalog::new();
    let system = start(&catalog, three_providers("alpha")).await;
    let mut events = system.subscribe();

    system.shutdown().await;
    system.shutdown().await;

    assert_eq!(system.state(), SystemState::Stopped);
    assert!(!system.health_checker().is_monitoring());
    assert!(!system.registry().is_monitoring());
    assert!(system.available_providers().await.is_empty());
    for name in ["alpha", "beta", "gamma"] {
        assert_eq!(catalog.get(name).unwrap().cleanups(), 1);
    }
    let shutdowns = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, AiEvent::Shutdown))
        .count();
    assert_eq!(shutdowns, 1);
}

#[tokio::test]
async fn test_shutdown_during_initialize_wins() {
    let catalog = MockCatalog::new();
    let alpha = catalog.add(MockProvider::new("alpha"));
    alpha.set_initialize_delay(Duration::from_millis(200));
    let beta = catalog.add(MockProvider::new("beta"));
    let config = test_system_config(vec![
        mock_config("alpha").with_priority(1),
        mock_config("beta"),
    ]);
    let system = Arc::new(AiSystem::new(config));
    register_mocks(&system, &catalog).await;

    let starting = tokio::spawn({
        let system = Arc::clone(&system);
        async move { system.initialize().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    system.shutdown().await;
    assert_eq!(system.state(), SystemState::Stopped);

    let err = starting.await.unwrap().unwrap_err();
    assert!(matches!(err, ProviderError::NotInitialized(_)));
    assert_eq!(system.state(), SystemState::Stopped);
    assert!(system.available_providers().await.is_empty());
    assert!(!system.health_checker().is_monitoring());
    assert!(!system.registry().is_monitoring());
    assert_eq!(alpha.cleanups(), 1);
    assert_eq!(catalog.created(), 1, "beta must never be created");
    assert_eq!(beta.cleanups(), 0);

    let err = system
        .generate(GenerationRequest::new("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::NotInitialized(_)));
}

#[tokio::test]
async fn test_providers_added_before_initialize_are_kept() {
    let catalog = MockCatalog::new();
    let system = AiSystem::new(test_system_config(vec![mock_config("alpha")]));
    register_mocks(&system, &catalog).await;

    system.add_provider(mock_config("beta")).await.unwrap();
    system.initialize().await.unwrap();

    assert_eq!(system.state(), SystemState::Ready);
    let mut names = system.available_providers().await;
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    assert_eq!(catalog.created(), 2);
    assert!(system.config().is_provider_enabled("beta"));
    let response = system
        .generate(GenerationRequest::new("hi").prefer("beta"))
        .await
        .unwrap();
    assert_eq!(response.provider, "beta");
    system.shutdown().await;
}

#[tokio::test]
async fn test_local_runner_added_before_initialize_stays_enabled() {
    let catalog = MockCatalog::new();
    catalog.add(MockProvider::with_kind("ollama", ProviderKind::LocalModelRunner));
    let system = AiSystem::new(test_system_config(vec![mock_config("alpha")]));
    register_mocks(&system, &catalog).await;

    system
        .add_provider(ProviderConfig::new(
            "ollama",
            ProviderSettings::local("http://127.0.0.1:9"),
        ))
        .await
        .unwrap();
    system.initialize().await.unwrap();

    assert!(system.registry().has_provider("ollama").await);
    assert!(system.config().is_provider_enabled("ollama"));
    assert_eq!(system.available_providers().await.len(), 2);
    system.shutdown().await;
}

#[tokio::test]
async fn test_stalled_stream_open_times_out() {
    let catalog = MockCatalog::new();
    let config = test_system_config(vec![mock_config("alpha")
        .with_timeout(Duration::from_millis(100))
        .with_max_concurrent_requests(1)]);
    let system = start(&catalog, config).await;
    let alpha = catalog.get("alpha").unwrap();
    alpha.set_stream_open_delay(Duration::from_secs(3600));

    let opened = tokio::time::timeout(
        Duration::from_secs(2),
        system.generate_stream(GenerationRequest::new("stream please")),
    )
    .await
    .expect("opening a stream must not hang");
    let err = opened.err().expect("stalled open fails");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.provider(), Some("alpha"));

    // The only request slot was given back.
    alpha.set_stream_open_delay(Duration::ZERO);
    let response = tokio::time::timeout(
        Duration::from_secs(1),
        system.generate(GenerationRequest::new("hi")),
    )
    .await
    .expect("slot must be released")
    .unwrap();
    assert_eq!(response.provider, "alpha");
    system.shutdown().await;
}

#[tokio::test]
async fn test_in_flight_request_does_not_revive_removed_metrics() {
    let catalog = MockCatalog::new();
    let system = Arc::new(start(&catalog, three_providers("alpha")).await);
    catalog
        .get("alpha")
        .unwrap()
        .set_delay(Duration::from_millis(300));

    let in_flight = tokio::spawn({
        let system = Arc::clone(&system);
        async move { system.generate(GenerationRequest::new("slow")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(system.remove_provider("alpha").await);
    assert!(system.health_checker().metrics("alpha").is_none());

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.provider, "alpha");
    assert!(system.health_checker().metrics("alpha").is_none());
    assert!(!system.health_checker().all_metrics().contains_key("alpha"));
    system.shutdown().await;
}
