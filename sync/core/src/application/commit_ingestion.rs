// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Commit ingestion
//!
//! Commit records carry `repository` and `branch` attributes set by the
//! collector. All commits on one branch share a parent: the first time a
//! branch is seen its repository overview (summary and structural graph) is
//! stored once under `repo:{scope}:{repository}@{branch}`; each commit is
//! then stored chunked under `commit:{scope}:{repository}:{hash}`.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** `RecordProcessor` for `ResourceKind::Commit`

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::application::ingestion_pipeline::{ProcessingError, RecordProcessor};
use crate::domain::ingestion::{IngestionRecord, RecordStats, ResourceKind};
use crate::domain::knowledge::{chunk_text, KnowledgeDocument, KnowledgeStore, StructuredPayload};
use crate::domain::provider::CommitDetails;
use crate::infrastructure::registry::ServiceClientRegistry;

pub const REPOSITORY_ATTRIBUTE: &str = "repository";
pub const BRANCH_ATTRIBUTE: &str = "branch";
const DEFAULT_BRANCH: &str = "main";
const DEFAULT_MAX_CHUNK_CHARS: usize = 2000;

pub struct CommitRecordProcessor {
    registry: Arc<ServiceClientRegistry>,
    store: Arc<dyn KnowledgeStore>,
    provider: String,
    max_chunk_chars: usize,
}

impl CommitRecordProcessor {
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

    fn branch(record: &IngestionRecord) -> &str {
        record.attribute(BRANCH_ATTRIBUTE).unwrap_or(DEFAULT_BRANCH)
    }

    fn repository(record: &IngestionRecord) -> Result<&str, ProcessingError> {
        record.attribute(REPOSITORY_ATTRIBUTE).ok_or_else(|| {
            ProcessingError::Failed(format!(
                "commit {} has no '{}' attribute",
                record.source_id, REPOSITORY_ATTRIBUTE
            ))
        })
    }
}

fn compose(commit: &CommitDetails) -> String {
    let mut text = format!(
        "commit {}\nAuthor: {}\nDate: {}\n\n{}",
        commit.hash,
        commit.author,
        commit.committed_at.to_rfc3339(),
        commit.message.trim()
    );
    if !commit.files_changed.is_empty() {
        text.push_str("\n\nFiles changed:");
        for file in &commit.files_changed {
            text.push_str("\n- ");
            text.push_str(file);
        }
    }
    if !commit.diff_summary.trim().is_empty() {
        text.push_str("\n\n");
        text.push_str(commit.diff_summary.trim());
    }
    text
}

#[async_trait]
impl RecordProcessor for CommitRecordProcessor {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Commit
    }

    fn parent_key(&self, record: &IngestionRecord) -> Option<String> {
        record
            .attribute(REPOSITORY_ATTRIBUTE)
            .map(|repository| format!("{}@{}", repository, Self::branch(record)))
    }

    fn admits(&self, _record: &IngestionRecord) -> bool {
        self.registry.is_available(&self.provider)
    }

    async fn enrich_parent(
        &self,
        parent: &str,
        records: &[IngestionRecord],
    ) -> Result<(), ProcessingError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let repository = Self::repository(first)?;
        let branch = Self::branch(first);

        let overview = self
            .registry
            .with_client(&self.provider, |client| async move {
                client
                    .as_source_repository()?
                    .repository_overview(repository, branch)
                    .await
            })
            .await?;

        let payload = serde_json::to_value(&overview)
            .map_err(|e| ProcessingError::Failed(format!("repository overview not serializable: {}", e)))?;

        self.store
            .ingest_structured(&StructuredPayload {
                source_id: format!("repo:{}:{}", first.scope, parent),
                scope: first.scope.clone(),
                payload,
            })
            .await?;
        Ok(())
    }

    async fn process(&self, record: &IngestionRecord) -> Result<RecordStats, ProcessingError> {
        let repository = Self::repository(record)?;
        let hash = record.source_id.as_str();

        let commit = self
            .registry
            .with_client(&self.provider, |client| async move {
                client.as_source_repository()?.fetch_commit(repository, hash).await
            })
            .await?;

        let source_id = format!("commit:{}:{}:{}", record.scope, repository, commit.hash);
        let chunks = chunk_text(&source_id, &compose(&commit), self.max_chunk_chars);

        let mut metadata = BTreeMap::new();
        metadata.insert(REPOSITORY_ATTRIBUTE.to_string(), repository.to_string());
        metadata.insert(BRANCH_ATTRIBUTE.to_string(), Self::branch(record).to_string());
        metadata.insert("author".to_string(), commit.author.clone());

        let stored = self
            .store
            .ingest(&KnowledgeDocument {
                source_id,
                scope: record.scope.clone(),
                resource_kind: ResourceKind::Commit,
                title: commit.message.lines().next().unwrap_or_default().to_string(),
                chunks,
                metadata,
            })
            .await?;

        Ok(RecordStats::from([
            ("chunks".to_string(), stored as i64),
            ("files_changed".to_string(), commit.files_changed.len() as i64),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_compose_lists_files() {
        let commit = CommitDetails {
            hash: "abc123".into(),
            author: "dana".into(),
            message: "Fix login redirect\n\nSafari dropped the cookie.".into(),
            files_changed: vec!["src/auth.rs".into(), "src/session.rs".into()],
            diff_summary: "+12 -3".into(),
            committed_at: Utc::now(),
        };
        let text = compose(&commit);
        assert!(text.starts_with("commit abc123\nAuthor: dana"));
        assert!(text.contains("Files changed:\n- src/auth.rs\n- src/session.rs"));
        assert!(text.ends_with("+12 -3"));
    }
}
