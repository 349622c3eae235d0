// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use aegis_sync_core::domain::ingestion::{IngestionRecord, ResourceKind, Scope};
use aegis_sync_core::domain::provider::{
    CommitDetails, IssueDetails, IssueStatus, IssueTrackerClient, ProviderClient,
    ProviderConnector, ProviderDescriptor, ProviderError, ProviderKind, RepositoryOverview,
    SourceRepositoryClient,
};
use aegis_sync_core::domain::repository::IngestionRecordRepository;
use aegis_sync_core::domain::sync_config::{CircuitBreakerConfig, ProviderConfig, RateLimitConfig};
use aegis_sync_core::infrastructure::circuit_breaker::CircuitBreakerRegistry;
use aegis_sync_core::infrastructure::rate_limiter::DomainRateLimiter;
use aegis_sync_core::infrastructure::registry::ServiceClientRegistry;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn scope() -> Scope {
    Scope::new("acme", "web")
}

pub fn descriptor(id: &str, kind: ProviderKind) -> ProviderDescriptor {
    ProviderDescriptor {
        provider_id: id.to_string(),
        display_name: format!("{} (mock)", id),
        kind,
        capabilities: vec![],
        version: Some("1.0".to_string()),
    }
}

pub fn issue(key: &str) -> IssueDetails {
    IssueDetails {
        key: key.to_string(),
        title: format!("Issue {}", key),
        body: "Login fails on Safari after the redirect.".to_string(),
        status: IssueStatus::Open,
        labels: vec!["bug".to_string()],
        comments: vec![],
        url: None,
    }
}

/// Issue tracker that serves canned issues and can be scripted to fail
#[derive(Default)]
pub struct MockIssueTracker {
    pub issues: Mutex<HashMap<String, IssueDetails>>,
    /// Errors returned (front first) before any issue is served
    pub scripted_errors: Mutex<VecDeque<ProviderError>>,
    /// Keys that always fail with a remote error
    pub broken: Mutex<HashSet<String>>,
    pub fetches: AtomicUsize,
}

impl MockIssueTracker {
    pub fn with_issues(keys: &[&str]) -> Self {
        let tracker = Self::default();
        {
            let mut issues = tracker.issues.lock().unwrap();
            for key in keys {
                issues.insert(key.to_string(), issue(key));
            }
        }
        tracker
    }

    pub fn fail_next(&self, error: ProviderError) {
        self.scripted_errors.lock().unwrap().push_back(error);
    }

    pub fn break_key(&self, key: &str) {
        self.broken.lock().unwrap().insert(key.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssueTrackerClient for MockIssueTracker {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError> {
        Ok(descriptor("jira", ProviderKind::IssueTracker))
    }

    async fn fetch_issue(&self, key: &str) -> Result<IssueDetails, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.scripted_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.broken.lock().unwrap().contains(key) {
            return Err(ProviderError::Remote(format!("issue {} body is unparseable", key)));
        }
        self.issues
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ProviderError::Remote(format!("issue {} does not exist", key)))
    }
}

/// Source repository serving synthetic commits
#[derive(Default)]
pub struct MockSourceRepository {
    pub overview_calls: AtomicUsize,
    pub commit_fetches: AtomicUsize,
    pub failing_overview: Mutex<Option<ProviderError>>,
}

#[async_trait]
impl SourceRepositoryClient for MockSourceRepository {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError> {
        Ok(descriptor("git", ProviderKind::SourceRepository))
    }

    async fn fetch_commit(&self, repository: &str, hash: &str) -> Result<CommitDetails, ProviderError> {
        self.commit_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(CommitDetails {
            hash: hash.to_string(),
            author: "dana".to_string(),
            message: format!("Change {} in {}", hash, repository),
            files_changed: vec!["src/lib.rs".to_string(), "README.md".to_string()],
            diff_summary: "+10 -2".to_string(),
            committed_at: Utc::now(),
        })
    }

    async fn repository_overview(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<RepositoryOverview, ProviderError> {
        self.overview_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failing_overview.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(RepositoryOverview {
            repository: repository.to_string(),
            branch: branch.to_string(),
            summary: "Web frontend".to_string(),
            modules: vec!["auth".to_string()],
            edges: vec![],
        })
    }
}

/// Hands out pre-built clients per endpoint, one per connect
#[derive(Default)]
pub struct MockConnector {
    pub clients: Mutex<HashMap<String, VecDeque<ProviderClient>>>,
    pub connects: AtomicUsize,
}

impl MockConnector {
    pub fn serve(&self, endpoint: &str, client: ProviderClient) {
        self.clients
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(client);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderConnector for MockConnector {
    async fn connect(&self, config: &ProviderConfig) -> Result<ProviderClient, ProviderError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.clients
            .lock()
            .unwrap()
            .get_mut(&config.endpoint)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| {
                ProviderError::Unavailable(format!("Connection refused: {}", config.endpoint))
            })
    }
}

pub fn breaker_config(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        open_duration_ms: 60_000,
    }
}

pub fn remote_registry(
    providers: Vec<ProviderConfig>,
    connector: Arc<MockConnector>,
    failure_threshold: u32,
) -> ServiceClientRegistry {
    ServiceClientRegistry::new(
        providers,
        connector,
        Arc::new(CircuitBreakerRegistry::new(breaker_config(failure_threshold))),
        Arc::new(DomainRateLimiter::new(RateLimitConfig::disabled(), Duration::from_secs(300))),
    )
}

/// Registry with in-process issue tracker ("jira") and source repository ("git")
pub fn local_registry(
    tracker: Arc<MockIssueTracker>,
    repository: Arc<MockSourceRepository>,
    failure_threshold: u32,
) -> Arc<ServiceClientRegistry> {
    let registry = remote_registry(vec![], Arc::new(MockConnector::default()), failure_threshold);
    registry.register_local(
        "jira",
        ProviderClient::IssueTracker(tracker),
        descriptor("jira", ProviderKind::IssueTracker),
    );
    registry.register_local(
        "git",
        ProviderClient::SourceRepository(repository),
        descriptor("git", ProviderKind::SourceRepository),
    );
    Arc::new(registry)
}

pub async fn seed_issues(repo: &dyn IngestionRecordRepository, keys: &[&str]) -> Vec<IngestionRecord> {
    let mut records = Vec::new();
    for (offset, key) in keys.iter().enumerate() {
        let mut record = IngestionRecord::new(scope(), ResourceKind::Issue, *key);
        // Deterministic discovery order
        record.discovered_at = record.discovered_at - chrono::Duration::seconds((keys.len() - offset) as i64);
        assert!(repo.insert_if_absent(&record).await.unwrap());
        records.push(record);
    }
    records
}

pub async fn seed_commits(
    repo: &dyn IngestionRecordRepository,
    repository: &str,
    branch: &str,
    hashes: &[&str],
) -> Vec<IngestionRecord> {
    let mut records = Vec::new();
    for (offset, hash) in hashes.iter().enumerate() {
        let mut record = IngestionRecord::new(scope(), ResourceKind::Commit, *hash)
            .with_attribute("repository", repository)
            .with_attribute("branch", branch);
        record.discovered_at = record.discovered_at - chrono::Duration::seconds((hashes.len() - offset) as i64);
        assert!(repo.insert_if_absent(&record).await.unwrap());
        records.push(record);
    }
    records
}
