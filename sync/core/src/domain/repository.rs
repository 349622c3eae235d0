// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contract for the `IngestionRecord` aggregate. The interface is
//! defined in the domain layer and implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `IngestionRecordRepository` | `IngestionRecord` | `InMemoryIngestionRecordRepository`, `PostgresIngestionRecordRepository` |
//!
//! ## Concurrency Contract
//!
//! `transition` is a compare-and-set: it succeeds only when the stored record
//! still has the expected state *and* the expected `last_transition_at`. Two
//! pipeline instances racing to claim the same NEW record therefore see
//! exactly one `Some(..)` and one `None`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ingestion::{
    IngestionRecord, RecordId, RecordState, RecordTransition, ResourceKind, Scope, TransitionError,
};

/// Repository interface for IngestionRecord aggregates
#[async_trait]
pub trait IngestionRecordRepository: Send + Sync {
    /// Insert a newly discovered record. Returns `false` when a record with the
    /// same `(scope, resource_kind, source_id)` already exists.
    async fn insert_if_absent(&self, record: &IngestionRecord) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: RecordId) -> Result<Option<IngestionRecord>, RepositoryError>;

    async fn find_by_source(
        &self,
        scope: &Scope,
        resource_kind: ResourceKind,
        source_id: &str,
    ) -> Result<Option<IngestionRecord>, RepositoryError>;

    /// Records of one kind in one state, oldest-discovered first
    async fn find_by_state(
        &self,
        resource_kind: ResourceKind,
        state: RecordState,
        limit: Option<usize>,
    ) -> Result<Vec<IngestionRecord>, RepositoryError>;

    /// INDEXING records whose claim is older than `claimed_before`, oldest-discovered first
    async fn find_stale_claims(
        &self,
        resource_kind: ResourceKind,
        claimed_before: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<IngestionRecord>, RepositoryError>;

    /// Atomically apply `transition` if the stored record still matches
    /// `expected_state` and `expected_transition_at`.
    ///
    /// Returns the updated record, or `None` when another writer got there first.
    async fn transition(
        &self,
        id: RecordId,
        expected_state: RecordState,
        expected_transition_at: DateTime<Utc>,
        transition: RecordTransition,
    ) -> Result<Option<IngestionRecord>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
