// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use aegis_sync_core::domain::circuit::CircuitStatus;
use aegis_sync_core::domain::events::SyncEvent;
use aegis_sync_core::domain::provider::{ProviderClient, ProviderError, ProviderKind};
use aegis_sync_core::domain::sync_config::ProviderConfig;
use aegis_sync_core::infrastructure::event_bus::EventBus;
use aegis_sync_core::infrastructure::registry::RegistryError;
use common::{remote_registry, MockConnector, MockIssueTracker};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const JIRA: &str = "http://jira.test";
const GITLAB: &str = "http://gitlab.test";

fn providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new("jira", ProviderKind::IssueTracker, JIRA),
        ProviderConfig::new("gitlab", ProviderKind::SourceRepository, GITLAB),
    ]
}

#[tokio::test]
async fn test_unreachable_provider_is_skipped_at_startup() {
    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(Arc::new(MockIssueTracker::with_issues(&["WEB-1"]))));

    let registry = remote_registry(providers(), connector.clone(), 3);
    let registered = registry.initialize().await;

    assert_eq!(registered, 1);
    assert_eq!(registry.registered_providers(), vec!["jira".to_string()]);
    assert!(matches!(
        registry.get_client("gitlab"),
        Err(RegistryError::NotRegistered(name)) if name == "gitlab"
    ));
    assert!(registry.get_client_or_none("gitlab").is_none());
    assert!(registry.is_available("jira"));
    assert!(!registry.is_available("gitlab"));
}

#[tokio::test]
async fn test_kind_mismatch_is_not_registered() {
    let connector = Arc::new(MockConnector::default());
    // Serves an issue tracker where a source repository is configured
    connector.serve(GITLAB, ProviderClient::IssueTracker(Arc::new(MockIssueTracker::default())));

    let registry = remote_registry(providers(), connector, 3);
    assert_eq!(registry.initialize().await, 0);
    assert!(registry.registered_providers().is_empty());
}

#[tokio::test]
async fn test_invalidated_session_is_rebuilt_and_retried_once() {
    let stale = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));
    stale.fail_next(ProviderError::classify("status: CANCELLED, message: \"operation was cancelled\""));
    let fresh = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));

    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(stale.clone()));
    connector.serve(JIRA, ProviderClient::IssueTracker(fresh.clone()));

    let bus = EventBus::with_default_capacity();
    let mut events = bus.subscribe_provider("jira");
    let registry = remote_registry(providers(), connector.clone(), 3).with_event_bus(bus);
    registry.initialize().await;
    let first_generation = registry.handle("jira").unwrap().generation;

    let issue = registry
        .with_client("jira", |client| async move {
            client.as_issue_tracker()?.fetch_issue("WEB-1").await
        })
        .await
        .unwrap();

    assert_eq!(issue.key, "WEB-1");
    // Startup discovery of both providers plus exactly one rebuild
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(stale.fetch_count(), 1);
    assert_eq!(fresh.fetch_count(), 1);
    assert!(registry.handle("jira").unwrap().generation > first_generation);

    let breaker = registry.breakers().get("jira");
    assert_eq!(breaker.current_state(), CircuitStatus::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);

    let mut saw_reconnect = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(std::time::Duration::from_millis(50), events.recv()).await
    {
        if matches!(event, SyncEvent::ProviderReconnected { .. }) {
            saw_reconnect = true;
        }
    }
    assert!(saw_reconnect);
}

#[tokio::test]
async fn test_second_invalidation_is_surfaced_without_another_retry() {
    let stale = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));
    stale.fail_next(ProviderError::ConnectionInvalidated("broken pipe".into()));
    let fresh = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));
    fresh.fail_next(ProviderError::ConnectionInvalidated("broken pipe".into()));

    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(stale.clone()));
    connector.serve(JIRA, ProviderClient::IssueTracker(fresh.clone()));

    let registry = remote_registry(providers(), connector.clone(), 5);
    registry.initialize().await;

    let result = registry
        .with_client("jira", |client| async move {
            client.as_issue_tracker()?.fetch_issue("WEB-1").await
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, RegistryError::RetriesExhausted { .. }));
    assert!(matches!(
        err.provider_error(),
        Some(ProviderError::ConnectionInvalidated(_))
    ));
    assert!(!err.is_retry_later());
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(stale.fetch_count() + fresh.fetch_count(), 2);
}

#[tokio::test]
async fn test_refused_call_is_reconnected_and_retried() {
    let stale = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));
    stale.fail_next(ProviderError::classify("Connection refused (os error 111)"));
    let fresh = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));

    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(stale.clone()));
    connector.serve(JIRA, ProviderClient::IssueTracker(fresh.clone()));

    let registry = remote_registry(providers(), connector.clone(), 5);
    registry.initialize().await;

    let issue = registry
        .with_client("jira", |client| async move {
            client.as_issue_tracker()?.fetch_issue("WEB-1").await
        })
        .await
        .unwrap();

    assert_eq!(issue.key, "WEB-1");
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(stale.fetch_count(), 1);
    assert_eq!(fresh.fetch_count(), 1);
    assert_eq!(registry.breakers().get("jira").consecutive_failures(), 0);
}

#[tokio::test]
async fn test_open_breaker_refuses_without_calling_provider() {
    let tracker = Arc::new(MockIssueTracker::default());
    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(tracker.clone()));

    let registry = remote_registry(providers(), connector.clone(), 2);
    registry.initialize().await;

    // The call and the refused rebuild are two failures
    tracker.fail_next(ProviderError::Unavailable("timed out".into()));
    let err = registry
        .with_client("jira", |client| async move {
            client.as_issue_tracker()?.fetch_issue("WEB-1").await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::RetriesExhausted { .. }));
    assert!(!err.is_retry_later());
    assert_eq!(tracker.fetch_count(), 1);
    assert_eq!(connector.connect_count(), 3);
    assert!(!registry.is_available("jira"));

    let calls = Arc::new(AtomicUsize::new(0));
    let err = registry
        .with_client("jira", |client| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                client.as_issue_tracker()?.fetch_issue("WEB-1").await
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::CircuitOpen(_)));
    assert!(err.is_retry_later());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.fetch_count(), 1);
}

#[tokio::test]
async fn test_remote_error_text_does_not_trigger_reconnect() {
    let tracker = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));
    tracker.fail_next(ProviderError::Remote("HTTP 400: issue was cancelled".into()));
    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(tracker.clone()));

    let registry = remote_registry(providers(), connector.clone(), 1);
    registry.initialize().await;
    let generation = registry.handle("jira").unwrap().generation;

    let err = registry
        .with_client("jira", |client| async move {
            client.as_issue_tracker()?.fetch_issue("WEB-1").await
        })
        .await
        .unwrap_err();

    assert!(matches!(err.provider_error(), Some(ProviderError::Remote(_))));
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(tracker.fetch_count(), 1);
    assert_eq!(registry.handle("jira").unwrap().generation, generation);
    assert_eq!(registry.breakers().get("jira").current_state(), CircuitStatus::Closed);
    assert_eq!(registry.breakers().get("jira").consecutive_failures(), 0);
}

#[tokio::test]
async fn test_busy_remote_does_not_trip_breaker() {
    let tracker = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));
    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(tracker.clone()));

    let registry = remote_registry(providers(), connector, 1);
    registry.initialize().await;

    for _ in 0..3 {
        tracker.fail_next(ProviderError::classify("429 Too Many Requests, try later"));
        let err = registry
            .with_client("jira", |client| async move {
                client.as_issue_tracker()?.fetch_issue("WEB-1").await
            })
            .await
            .unwrap_err();
        assert!(err.is_retry_later());
    }

    assert!(registry.is_available("jira"));
    assert_eq!(registry.breakers().get("jira").current_state(), CircuitStatus::Closed);

    let issue = registry
        .with_client("jira", |client| async move {
            client.as_issue_tracker()?.fetch_issue("WEB-1").await
        })
        .await
        .unwrap();
    assert_eq!(issue.key, "WEB-1");
}

#[tokio::test]
async fn test_wrong_client_kind_is_reported() {
    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(Arc::new(MockIssueTracker::default())));

    let registry = remote_registry(providers(), connector, 3);
    registry.initialize().await;

    let err = registry
        .with_client("jira", |client| async move {
            client.as_source_repository()?.fetch_commit("web", "abc").await
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err.provider_error(),
        Some(ProviderError::KindMismatch {
            expected: ProviderKind::SourceRepository,
            actual: ProviderKind::IssueTracker,
        })
    ));
}

#[tokio::test]
async fn test_reconnect_registers_provider_missed_at_startup() {
    let connector = Arc::new(MockConnector::default());
    let registry = remote_registry(providers(), connector.clone(), 3);
    assert_eq!(registry.initialize().await, 0);

    connector.serve(JIRA, ProviderClient::IssueTracker(Arc::new(MockIssueTracker::default())));
    let handle = registry.reconnect("jira").await.unwrap();

    assert_eq!(handle.provider_id, "jira");
    assert_eq!(handle.endpoint.as_deref(), Some(JIRA));
    assert!(registry.get_client("jira").is_ok());
}

#[tokio::test]
async fn test_failed_reconnect_keeps_previous_client() {
    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(Arc::new(MockIssueTracker::default())));

    let bus = EventBus::with_default_capacity();
    let mut events = bus.subscribe();
    let registry = remote_registry(providers(), connector, 3).with_event_bus(bus);
    registry.initialize().await;
    let before = registry.handle("jira").unwrap().generation;

    let err = registry.reconnect("jira").await.unwrap_err();
    assert!(matches!(err.provider_error(), Some(ProviderError::Unavailable(_))));
    assert_eq!(registry.handle("jira").unwrap().generation, before);

    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, SyncEvent::ProviderReconnectFailed { provider, .. } if provider == "jira")));
}

fn processor_bug() -> ProviderError {
    panic!("processor bug")
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_probe_does_not_wedge_breaker() {
    let tracker = Arc::new(MockIssueTracker::with_issues(&["WEB-1"]));
    let connector = Arc::new(MockConnector::default());
    connector.serve(JIRA, ProviderClient::IssueTracker(tracker.clone()));
    let registry = remote_registry(providers(), connector, 1);
    registry.initialize().await;
    let breaker = registry.breakers().get("jira");

    let fetch = || {
        registry.with_client("jira", |client| async move {
            client.as_issue_tracker()?.fetch_issue("WEB-1").await
        })
    };

    // Probe panics inside the caller's unwind guard
    breaker.record_failure();
    tokio::time::advance(Duration::from_secs(61)).await;
    let outcome = AssertUnwindSafe(registry.with_client("jira", |_client| async move {
        Err::<(), _>(processor_bug())
    }))
    .catch_unwind()
    .await;
    assert!(outcome.is_err());
    assert!(matches!(fetch().await, Err(RegistryError::CircuitOpen(_))));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(fetch().await.unwrap().key, "WEB-1");
    assert_eq!(breaker.current_state(), CircuitStatus::Closed);

    // Probe is dropped by a caller-side timeout
    breaker.record_failure();
    tokio::time::advance(Duration::from_secs(61)).await;
    let timed_out = tokio::time::timeout(
        Duration::from_secs(5),
        registry.with_client("jira", |_client| std::future::pending::<Result<(), ProviderError>>()),
    )
    .await;
    assert!(timed_out.is_err());
    assert!(matches!(fetch().await, Err(RegistryError::CircuitOpen(_))));

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(fetch().await.unwrap().key, "WEB-1");
    assert_eq!(breaker.current_state(), CircuitStatus::Closed);
}
