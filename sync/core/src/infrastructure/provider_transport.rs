// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// HTTP Provider Transport
//
// Anti-Corruption Layer for provider microservices speaking JSON over HTTP.
// Discovery is `GET {endpoint}/descriptor`; every operation is
// `POST {endpoint}/rpc/{operation}` with a JSON body.
//
// Transport failures are mapped onto the ProviderError taxonomy so the
// registry can tell a dead session from a busy remote.

use crate::domain::provider::{
    CommitDetails, EnrichmentClient, EnrichmentResult, IssueDetails, IssueTrackerClient,
    OrchestratorClient, ProviderClient, ProviderConnector, ProviderDescriptor, ProviderError,
    ProviderKind, RepositoryOverview, SourceRepositoryClient, TaskReceipt, TaskSubmission,
};
use crate::domain::sync_config::ProviderConfig;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Builds `HttpProviderClient`s for configured providers
#[derive(Default)]
pub struct HttpProviderConnector;

impl HttpProviderConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderConnector for HttpProviderConnector {
    async fn connect(&self, config: &ProviderConfig) -> Result<ProviderClient, ProviderError> {
        let client = Arc::new(HttpProviderClient::new(
            config.name.clone(),
            config.endpoint.clone(),
            Duration::from_secs(config.timeout_seconds),
        )?);

        Ok(match config.kind {
            ProviderKind::IssueTracker => ProviderClient::IssueTracker(client),
            ProviderKind::SourceRepository => ProviderClient::SourceRepository(client),
            ProviderKind::Orchestrator => ProviderClient::Orchestrator(client),
            ProviderKind::Enrichment => ProviderClient::Enrichment(client),
        })
    }
}

pub struct HttpProviderClient {
    client: reqwest::Client,
    provider: String,
    endpoint: String,
}

impl HttpProviderClient {
    pub fn new(
        provider: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            provider: provider.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn call<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp, ProviderError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/rpc/{}", self.endpoint, operation);
        debug!(provider = %self.provider, operation, "Provider RPC");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        decode(response).await
    }
}

fn map_send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Unavailable(format!("request timed out: {}", e))
    } else if e.is_connect() {
        ProviderError::Unavailable(format!("connect failed: {}", e))
    } else {
        ProviderError::classify(format!("{:#}", anyhow::Error::new(e)))
    }
}

async fn decode<Resp: DeserializeOwned>(response: reqwest::Response) -> Result<Resp, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            {
                ProviderError::Busy(format!("HTTP {}: {}", status, body))
            } else {
                ProviderError::Remote(format!("HTTP {}: {}", status, body))
            },
        );
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))
}

impl HttpProviderClient {
    async fn discover(&self) -> Result<ProviderDescriptor, ProviderError> {
        let url = format!("{}/descriptor", self.endpoint);
        let response = self.client.get(&url).send().await.map_err(map_send_error)?;
        decode(response).await
    }
}

#[async_trait]
impl IssueTrackerClient for HttpProviderClient {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError> {
        self.discover().await
    }

    async fn fetch_issue(&self, key: &str) -> Result<IssueDetails, ProviderError> {
        self.call("fetch_issue", &json!({ "key": key })).await
    }
}

#[async_trait]
impl SourceRepositoryClient for HttpProviderClient {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError> {
        self.discover().await
    }

    async fn fetch_commit(&self, repository: &str, hash: &str) -> Result<CommitDetails, ProviderError> {
        self.call("fetch_commit", &json!({ "repository": repository, "hash": hash }))
            .await
    }

    async fn repository_overview(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<RepositoryOverview, ProviderError> {
        self.call(
            "repository_overview",
            &json!({ "repository": repository, "branch": branch }),
        )
        .await
    }
}

#[async_trait]
impl OrchestratorClient for HttpProviderClient {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError> {
        self.discover().await
    }

    async fn submit_task(&self, task: &TaskSubmission) -> Result<TaskReceipt, ProviderError> {
        self.call("submit_task", task).await
    }
}

#[async_trait]
impl EnrichmentClient for HttpProviderClient {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError> {
        self.discover().await
    }

    async fn enrich(&self, text: &str) -> Result<EnrichmentResult, ProviderError> {
        self.call("enrich", &json!({ "text": text })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(endpoint: &str) -> HttpProviderClient {
        HttpProviderClient::new("jira", endpoint, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_connector_wraps_configured_kind() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/descriptor")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"provider_id":"git","display_name":"Git","kind":"source-repository"}"#)
            .create_async()
            .await;

        let config = ProviderConfig::new("git", ProviderKind::SourceRepository, server.url());
        let client = HttpProviderConnector::new().connect(&config).await.unwrap();
        assert_eq!(client.kind(), ProviderKind::SourceRepository);

        let descriptor = client.descriptor().await.unwrap();
        assert_eq!(descriptor.display_name, "Git");
        assert!(descriptor.capabilities.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_issue_posts_rpc() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rpc/fetch_issue")
            .match_body(Matcher::Json(serde_json::json!({"key": "WEB-1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"key":"WEB-1","title":"Login fails","status":"open"}"#)
            .create_async()
            .await;

        let issue = client(&server.url()).fetch_issue("WEB-1").await.unwrap();
        assert_eq!(issue.title, "Login fails");
        assert!(issue.comments.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_saturation_maps_to_busy() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/rpc/enrich")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let err = client(&server.url()).enrich("text").await.unwrap_err();
        assert!(err.is_busy());
        assert!(!err.counts_as_breaker_failure());
    }

    #[tokio::test]
    async fn test_remote_error_and_bad_payload() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("POST", "/rpc/fetch_commit")
            .with_status(404)
            .with_body("no such commit")
            .create_async()
            .await;
        let _garbled = server
            .mock("POST", "/rpc/submit_task")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = client(&server.url());
        let err = client.fetch_commit("web", "abc").await.unwrap_err();
        assert!(matches!(err, ProviderError::Remote(ref msg) if msg.contains("no such commit")));

        let err = client
            .submit_task(&TaskSubmission {
                title: "t".into(),
                description: "d".into(),
                context: serde_json::Value::Null,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        // Port 9 (discard) is not expected to be listening locally.
        let err = client("http://127.0.0.1:9").enrich("text").await.unwrap_err();
        assert!(err.counts_as_breaker_failure());
    }
}
