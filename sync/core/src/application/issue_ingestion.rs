// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Issue ingestion
//!
//! Fetches an issue from the issue-tracker provider, flattens title, body,
//! labels and comments into one document and stores it chunked under
//! `issue:{tenant}/{project}:{key}`. Deleted issues are purged instead.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** `RecordProcessor` for `ResourceKind::Issue`

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::application::ingestion_pipeline::{ProcessingError, RecordProcessor};
use crate::domain::ingestion::{IngestionRecord, RecordStats, ResourceKind};
use crate::domain::knowledge::{chunk_text, KnowledgeDocument, KnowledgeStore};
use crate::domain::provider::{IssueDetails, IssueStatus};
use crate::infrastructure::registry::ServiceClientRegistry;

const DEFAULT_MAX_CHUNK_CHARS: usize = 2000;

pub struct IssueRecordProcessor {
    registry: Arc<ServiceClientRegistry>,
    store: Arc<dyn KnowledgeStore>,
    provider: String,
    max_chunk_chars: usize,
}

impl IssueRecordProcessor {
    pub fn new(
        registry: Arc<ServiceClientRegistry>,
        store: Arc<dyn KnowledgeStore>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            provider: provider.into(),
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }

    pub fn with_max_chunk_chars(mut self, max_chunk_chars: usize) -> Self {
        self.max_chunk_chars = max_chunk_chars;
        self
    }

    /// Knowledge-store key for an issue record
    pub fn source_id(record: &IngestionRecord) -> String {
        format!("issue:{}:{}", record.scope, record.source_id)
    }
}

fn compose(issue: &IssueDetails) -> String {
    let mut text = format!("# {}: {}", issue.key, issue.title.trim());
    if !issue.body.trim().is_empty() {
        text.push_str("\n\n");
        text.push_str(issue.body.trim());
    }
    if !issue.labels.is_empty() {
        text.push_str("\n\nLabels: ");
        text.push_str(&issue.labels.join(", "));
    }
    for comment in &issue.comments {
        if comment.body.trim().is_empty() {
            continue;
        }
        text.push_str(&format!(
            "\n\nComment by {} ({}):\n{}",
            comment.author,
            comment.created_at.format("%Y-%m-%d"),
            comment.body.trim()
        ));
    }
    text
}

#[async_trait]
impl RecordProcessor for IssueRecordProcessor {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Issue
    }

    fn admits(&self, _record: &IngestionRecord) -> bool {
        self.registry.is_available(&self.provider)
    }

    async fn process(&self, record: &IngestionRecord) -> Result<RecordStats, ProcessingError> {
        let key = record.source_id.as_str();
        let issue = self
            .registry
            .with_client(&self.provider, |client| async move {
                client.as_issue_tracker()?.fetch_issue(key).await
            })
            .await?;

        let source_id = Self::source_id(record);

        if issue.status == IssueStatus::Deleted {
            let purged = self.store.purge(&source_id).await?;
            return Ok(RecordStats::from([("purged".to_string(), purged as i64)]));
        }

        let chunks = chunk_text(&source_id, &compose(&issue), self.max_chunk_chars);

        let mut metadata = BTreeMap::new();
        metadata.insert("key".to_string(), issue.key.clone());
        metadata.insert(
            "status".to_string(),
            serde_json::to_value(&issue.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        );
        if let Some(url) = &issue.url {
            metadata.insert("url".to_string(), url.clone());
        }

        let stored = self
            .store
            .ingest(&KnowledgeDocument {
                source_id,
                scope: record.scope.clone(),
                resource_kind: ResourceKind::Issue,
                title: issue.title.clone(),
                chunks,
                metadata,
            })
            .await?;

        Ok(RecordStats::from([
            ("chunks".to_string(), stored as i64),
            ("comments".to_string(), issue.comments.len() as i64),
        ]))
    }
}
