// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Provider
//!
//! Domain interface for remote (and in-process) provider services.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Anti-corruption layer between the sync backbone and provider transports

// Provider kinds form a closed set. Each kind has one strongly-typed client
// trait, and `ProviderClient` is the tagged union the registry hands out.
// Transports (HTTP, gRPC, in-process) live in infrastructure/.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::domain::sync_config::ProviderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    IssueTracker,
    SourceRepository,
    Orchestrator,
    Enrichment,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::IssueTracker => "issue-tracker",
            ProviderKind::SourceRepository => "source-repository",
            ProviderKind::Orchestrator => "orchestrator",
            ProviderKind::Enrichment => "enrichment",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability descriptor returned by a provider's discovery call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub provider_id: String,
    pub display_name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Errors surfaced by provider transports
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The transport session was cancelled or broken; a fresh connection may succeed.
    #[error("Connection invalidated: {0}")]
    ConnectionInvalidated(String),

    /// Could not reach the remote at all (refused, timed out).
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The remote is alive but asked us to back off.
    #[error("Provider busy: {0}")]
    Busy(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider kind mismatch: expected {expected}, found {actual}")]
    KindMismatch {
        expected: ProviderKind,
        actual: ProviderKind,
    },
}

const INVALIDATION_SIGNATURES: &[&str] = &[
    "cancelled",
    "canceled",
    "broken pipe",
    "connection reset",
    "connection closed",
    "channel closed",
    "transport is closing",
    "session invalidated",
];

const BUSY_SIGNATURES: &[&str] = &["try later", "try again later", "too many requests", "busy"];

impl ProviderError {
    /// Build an error from a bare transport message, inspecting the text for
    /// known invalidation and saturation signatures.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        if INVALIDATION_SIGNATURES.iter().any(|sig| lowered.contains(sig)) {
            ProviderError::ConnectionInvalidated(message)
        } else if BUSY_SIGNATURES.iter().any(|sig| lowered.contains(sig)) {
            ProviderError::Busy(message)
        } else if lowered.contains("refused") || lowered.contains("timed out") {
            ProviderError::Unavailable(message)
        } else {
            ProviderError::Remote(message)
        }
    }

    /// Whether the session itself is known to be broken.
    ///
    /// Only transport-level messages are scanned. A `Remote` message carries
    /// the remote's own response body and never implies a dead session.
    pub fn is_connection_invalidated(&self) -> bool {
        match self {
            ProviderError::ConnectionInvalidated(_) => true,
            ProviderError::Unavailable(msg) => {
                let lowered = msg.to_lowercase();
                INVALIDATION_SIGNATURES.iter().any(|sig| lowered.contains(sig))
            }
            _ => false,
        }
    }

    /// Refused, timed out or invalidated. The registry answers these with a
    /// single reconnect and retry.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ProviderError::ConnectionInvalidated(_) | ProviderError::Unavailable(_)
        )
    }

    /// Transport failures count against the breaker; a busy or erroring remote
    /// is alive and does not.
    pub fn counts_as_breaker_failure(&self) -> bool {
        self.is_transport_failure()
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ProviderError::Busy(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Closed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDetails {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub comments: Vec<IssueComment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDetails {
    pub hash: String,
    pub author: String,
    pub message: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub diff_summary: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub relation: String,
}

/// Repository-level analysis shared by every commit on a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryOverview {
    pub repository: String,
    pub branch: String,
    pub summary: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReceipt {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[async_trait]
pub trait IssueTrackerClient: Send + Sync {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError>;

    async fn fetch_issue(&self, key: &str) -> Result<IssueDetails, ProviderError>;
}

#[async_trait]
pub trait SourceRepositoryClient: Send + Sync {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError>;

    async fn fetch_commit(&self, repository: &str, hash: &str) -> Result<CommitDetails, ProviderError>;

    async fn repository_overview(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<RepositoryOverview, ProviderError>;
}

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError>;

    async fn submit_task(&self, task: &TaskSubmission) -> Result<TaskReceipt, ProviderError>;
}

#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError>;

    async fn enrich(&self, text: &str) -> Result<EnrichmentResult, ProviderError>;
}

/// One strongly-typed handle per provider kind
#[derive(Clone)]
pub enum ProviderClient {
    IssueTracker(Arc<dyn IssueTrackerClient>),
    SourceRepository(Arc<dyn SourceRepositoryClient>),
    Orchestrator(Arc<dyn OrchestratorClient>),
    Enrichment(Arc<dyn EnrichmentClient>),
}

impl ProviderClient {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderClient::IssueTracker(_) => ProviderKind::IssueTracker,
            ProviderClient::SourceRepository(_) => ProviderKind::SourceRepository,
            ProviderClient::Orchestrator(_) => ProviderKind::Orchestrator,
            ProviderClient::Enrichment(_) => ProviderKind::Enrichment,
        }
    }

    /// Discovery call, dispatched to whichever kind this handle wraps
    pub async fn descriptor(&self) -> Result<ProviderDescriptor, ProviderError> {
        match self {
            ProviderClient::IssueTracker(c) => c.descriptor().await,
            ProviderClient::SourceRepository(c) => c.descriptor().await,
            ProviderClient::Orchestrator(c) => c.descriptor().await,
            ProviderClient::Enrichment(c) => c.descriptor().await,
        }
    }

    pub fn as_issue_tracker(&self) -> Result<&Arc<dyn IssueTrackerClient>, ProviderError> {
        match self {
            ProviderClient::IssueTracker(c) => Ok(c),
            other => Err(other.mismatch(ProviderKind::IssueTracker)),
        }
    }

    pub fn as_source_repository(&self) -> Result<&Arc<dyn SourceRepositoryClient>, ProviderError> {
        match self {
            ProviderClient::SourceRepository(c) => Ok(c),
            other => Err(other.mismatch(ProviderKind::SourceRepository)),
        }
    }

    pub fn as_orchestrator(&self) -> Result<&Arc<dyn OrchestratorClient>, ProviderError> {
        match self {
            ProviderClient::Orchestrator(c) => Ok(c),
            other => Err(other.mismatch(ProviderKind::Orchestrator)),
        }
    }

    pub fn as_enrichment(&self) -> Result<&Arc<dyn EnrichmentClient>, ProviderError> {
        match self {
            ProviderClient::Enrichment(c) => Ok(c),
            other => Err(other.mismatch(ProviderKind::Enrichment)),
        }
    }

    fn mismatch(&self, expected: ProviderKind) -> ProviderError {
        ProviderError::KindMismatch {
            expected,
            actual: self.kind(),
        }
    }
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderClient::{}", self.kind())
    }
}

/// A fully registered provider: client and descriptor are always both present.
#[derive(Debug, Clone)]
pub struct RemoteClientHandle {
    pub provider_id: String,
    pub client: ProviderClient,
    pub descriptor: ProviderDescriptor,
    /// `None` for providers registered in-process.
    pub endpoint: Option<String>,
    /// Bumped every time the handle is replaced.
    pub generation: u64,
    pub connected_at: DateTime<Utc>,
}

impl RemoteClientHandle {
    pub fn is_local(&self) -> bool {
        self.endpoint.is_none()
    }
}

/// Opens transport sessions for configured providers
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, config: &ProviderConfig) -> Result<ProviderClient, ProviderError>;
}
