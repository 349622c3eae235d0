// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Knowledge Store Adapters
//
// In-memory store for tests and single-node runs, and an HTTP adapter for a
// remote knowledge service. Both replace any previous payload stored under
// the same source id.

use crate::domain::knowledge::{
    KnowledgeDocument, KnowledgeStore, KnowledgeStoreError, StructuredPayload,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct StoreContents {
    documents: HashMap<String, KnowledgeDocument>,
    structured: HashMap<String, StructuredPayload>,
}

#[derive(Clone, Default)]
pub struct InMemoryKnowledgeStore {
    contents: Arc<RwLock<StoreContents>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, source_id: &str) -> Option<KnowledgeDocument> {
        self.contents.read().ok()?.documents.get(source_id).cloned()
    }

    pub fn structured(&self, source_id: &str) -> Option<StructuredPayload> {
        self.contents.read().ok()?.structured.get(source_id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.contents.read().map(|c| c.documents.len()).unwrap_or(0)
    }

    pub fn structured_count(&self) -> usize {
        self.contents.read().map(|c| c.structured.len()).unwrap_or(0)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreContents>, KnowledgeStoreError> {
        self.contents
            .write()
            .map_err(|e| KnowledgeStoreError::Transport(format!("lock poisoned: {}", e)))
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn ingest(&self, document: &KnowledgeDocument) -> Result<usize, KnowledgeStoreError> {
        let chunks = document.chunks.len();
        self.write()?
            .documents
            .insert(document.source_id.clone(), document.clone());
        Ok(chunks)
    }

    async fn ingest_structured(&self, payload: &StructuredPayload) -> Result<(), KnowledgeStoreError> {
        self.write()?
            .structured
            .insert(payload.source_id.clone(), payload.clone());
        Ok(())
    }

    async fn purge(&self, source_id: &str) -> Result<usize, KnowledgeStoreError> {
        let mut contents = self.write()?;
        contents.structured.remove(source_id);
        Ok(contents
            .documents
            .remove(source_id)
            .map(|d| d.chunks.len())
            .unwrap_or(0))
    }
}

/// Knowledge store reached over HTTP
pub struct HttpKnowledgeStore {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct IngestResponse {
    stored: usize,
}

#[derive(Deserialize)]
struct PurgeResponse {
    removed: usize,
}

impl HttpKnowledgeStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, KnowledgeStoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(KnowledgeStoreError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn transport(e: reqwest::Error) -> KnowledgeStoreError {
    KnowledgeStoreError::Transport(e.to_string())
}

#[async_trait]
impl KnowledgeStore for HttpKnowledgeStore {
    async fn ingest(&self, document: &KnowledgeDocument) -> Result<usize, KnowledgeStoreError> {
        let url = format!("{}/ingest", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(document)
            .send()
            .await
            .map_err(transport)?;

        let parsed: IngestResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| KnowledgeStoreError::Serialization(e.to_string()))?;
        debug!(source_id = %document.source_id, stored = parsed.stored, "Ingested document");
        Ok(parsed.stored)
    }

    async fn ingest_structured(&self, payload: &StructuredPayload) -> Result<(), KnowledgeStoreError> {
        let url = format!("{}/ingest/structured", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn purge(&self, source_id: &str) -> Result<usize, KnowledgeStoreError> {
        let mut url = url::Url::parse(&format!("{}/documents/", self.endpoint))
            .map_err(|e| KnowledgeStoreError::Transport(format!("invalid endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| KnowledgeStoreError::Transport("endpoint cannot be a base".to_string()))?
            .pop_if_empty()
            .push(source_id);

        let response = self.client.delete(url).send().await.map_err(transport)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let parsed: PurgeResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| KnowledgeStoreError::Serialization(e.to_string()))?;
        Ok(parsed.removed)
    }
}
