// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Knowledge Store Interface
//!
//! The knowledge store is the downstream collaborator that receives enriched
//! content. Every payload is keyed by a stable source identifier and
//! re-ingesting under the same identifier replaces the previous payload, so
//! the pipeline may safely reprocess a record after a restart.
//!
//! Implementations live in `crate::infrastructure::knowledge_store`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::domain::ingestion::{ResourceKind, Scope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub source_id: String,
    pub scope: Scope,
    pub resource_kind: ResourceKind,
    pub title: String,
    pub chunks: Vec<KnowledgeChunk>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Structured (graph-shaped) payload, e.g. a repository overview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredPayload {
    pub source_id: String,
    pub scope: Scope,
    pub payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeStoreError {
    #[error("Knowledge store unreachable: {0}")]
    Transport(String),

    #[error("Knowledge store rejected payload ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl KnowledgeStoreError {
    /// Unreachable, rate limited (429) or failing server-side (5xx).
    pub fn is_retry_later(&self) -> bool {
        match self {
            KnowledgeStoreError::Transport(_) => true,
            KnowledgeStoreError::Rejected { status, .. } => *status == 429 || (500..=599).contains(status),
            KnowledgeStoreError::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for KnowledgeStoreError {
    fn from(err: serde_json::Error) -> Self {
        KnowledgeStoreError::Serialization(err.to_string())
    }
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Store (or replace) a chunked document. Returns the number of chunks stored.
    async fn ingest(&self, document: &KnowledgeDocument) -> Result<usize, KnowledgeStoreError>;

    /// Store (or replace) a structured payload
    async fn ingest_structured(&self, payload: &StructuredPayload) -> Result<(), KnowledgeStoreError>;

    /// Remove everything stored under `source_id`. Returns the number of chunks removed.
    async fn purge(&self, source_id: &str) -> Result<usize, KnowledgeStoreError>;
}

/// Split `text` into chunks of at most `max_chars` characters, preferring
/// paragraph boundaries, then line boundaries, then hard splits.
///
/// Chunk ids are derived from the source id and chunk index, so re-chunking
/// the same source yields the same ids.
pub fn chunk_text(source_id: &str, text: &str, max_chars: usize) -> Vec<KnowledgeChunk> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        for segment in split_oversized(paragraph, max_chars) {
            let needed = if current.is_empty() {
                segment.chars().count()
            } else {
                current.chars().count() + 2 + segment.chars().count()
            };

            if needed > max_chars && !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&segment);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| KnowledgeChunk {
            id: chunk_id(source_id, index),
            index,
            text,
        })
        .collect()
}

fn split_oversized(paragraph: &str, max_chars: usize) -> Vec<String> {
    if paragraph.chars().count() <= max_chars {
        return vec![paragraph.to_string()];
    }

    let mut out = Vec::new();
    let mut current = String::new();
    for line in paragraph.lines() {
        let mut rest: Vec<char> = line.chars().collect();
        while rest.len() > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            let tail = rest.split_off(max_chars);
            out.push(rest.into_iter().collect());
            rest = tail;
        }
        let line: String = rest.into_iter().collect();
        if !current.is_empty() && current.chars().count() + 1 + line.chars().count() > max_chars {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn chunk_id(source_id: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b":");
    hasher.update(index.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}
