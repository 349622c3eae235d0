// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of `IngestionRecordRepository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve ingestion records
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **PostgresIngestionRecordRepository** - Durable, shared across processes
//! - **InMemoryIngestionRecordRepository** - Thread-safe HashMap-backed storage
//!   for tests and single-process runs
//!
//! Both implement `transition` as a compare-and-set on
//! `(state, last_transition_at)`.

pub mod postgres_ingestion;

use crate::domain::ingestion::{
    next_transition_timestamp, IngestionRecord, RecordId, RecordState, RecordTransition,
    ResourceKind, Scope,
};
use crate::domain::repository::{IngestionRecordRepository, RepositoryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use postgres_ingestion::PostgresIngestionRecordRepository;

type SourceKey = (Scope, ResourceKind, String);

#[derive(Default)]
struct RecordTable {
    records: HashMap<RecordId, IngestionRecord>,
    by_source: HashMap<SourceKey, RecordId>,
}

#[derive(Clone, Default)]
pub struct InMemoryIngestionRecordRepository {
    table: Arc<RwLock<RecordTable>>,
}

impl InMemoryIngestionRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, RecordTable>, RepositoryError> {
        self.table
            .read()
            .map_err(|e| RepositoryError::Database(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, RecordTable>, RepositoryError> {
        self.table
            .write()
            .map_err(|e| RepositoryError::Database(format!("lock poisoned: {}", e)))
    }

    fn select<P>(
        &self,
        resource_kind: ResourceKind,
        limit: Option<usize>,
        predicate: P,
    ) -> Result<Vec<IngestionRecord>, RepositoryError>
    where
        P: Fn(&IngestionRecord) -> bool,
    {
        let table = self.read()?;
        let mut matching: Vec<IngestionRecord> = table
            .records
            .values()
            .filter(|r| r.resource_kind == resource_kind && predicate(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[async_trait]
impl IngestionRecordRepository for InMemoryIngestionRecordRepository {
    async fn insert_if_absent(&self, record: &IngestionRecord) -> Result<bool, RepositoryError> {
        let mut table = self.write()?;
        let key = (
            record.scope.clone(),
            record.resource_kind,
            record.source_id.clone(),
        );
        if table.by_source.contains_key(&key) || table.records.contains_key(&record.id) {
            return Ok(false);
        }
        table.by_source.insert(key, record.id);
        table.records.insert(record.id, record.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: RecordId) -> Result<Option<IngestionRecord>, RepositoryError> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    async fn find_by_source(
        &self,
        scope: &Scope,
        resource_kind: ResourceKind,
        source_id: &str,
    ) -> Result<Option<IngestionRecord>, RepositoryError> {
        let table = self.read()?;
        let key = (scope.clone(), resource_kind, source_id.to_string());
        Ok(table
            .by_source
            .get(&key)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    async fn find_by_state(
        &self,
        resource_kind: ResourceKind,
        state: RecordState,
        limit: Option<usize>,
    ) -> Result<Vec<IngestionRecord>, RepositoryError> {
        self.select(resource_kind, limit, |r| r.state == state)
    }

    async fn find_stale_claims(
        &self,
        resource_kind: ResourceKind,
        claimed_before: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<IngestionRecord>, RepositoryError> {
        self.select(resource_kind, limit, |r| {
            r.state == RecordState::Indexing && r.last_transition_at < claimed_before
        })
    }

    async fn transition(
        &self,
        id: RecordId,
        expected_state: RecordState,
        expected_transition_at: DateTime<Utc>,
        transition: RecordTransition,
    ) -> Result<Option<IngestionRecord>, RepositoryError> {
        let mut table = self.write()?;
        let stored = table
            .records
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("ingestion record {}", id)))?;

        if stored.state != expected_state || stored.last_transition_at != expected_transition_at {
            return Ok(None);
        }

        let mut updated = stored.clone();
        updated.apply(transition, next_transition_timestamp(stored.last_transition_at))?;
        *stored = updated.clone();
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ingestion::RecordStats;
    use chrono::Duration;

    fn record(source_id: &str) -> IngestionRecord {
        IngestionRecord::new(Scope::new("acme", "web"), ResourceKind::Issue, source_id)
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_scope() {
        let repo = InMemoryIngestionRecordRepository::new();
        assert!(repo.insert_if_absent(&record("WEB-1")).await.unwrap());
        assert!(!repo.insert_if_absent(&record("WEB-1")).await.unwrap());

        let other_scope =
            IngestionRecord::new(Scope::new("acme", "api"), ResourceKind::Issue, "WEB-1");
        assert!(repo.insert_if_absent(&other_scope).await.unwrap());

        let found = repo
            .find_by_source(&Scope::new("acme", "web"), ResourceKind::Issue, "WEB-1")
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_find_by_state_orders_by_discovery() {
        let repo = InMemoryIngestionRecordRepository::new();
        let mut older = record("WEB-2");
        older.discovered_at = older.discovered_at - Duration::minutes(5);
        let newer = record("WEB-1");
        repo.insert_if_absent(&newer).await.unwrap();
        repo.insert_if_absent(&older).await.unwrap();

        let found = repo
            .find_by_state(ResourceKind::Issue, RecordState::New, None)
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["WEB-2", "WEB-1"]);

        let limited = repo
            .find_by_state(ResourceKind::Issue, RecordState::New, Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert!(repo
            .find_by_state(ResourceKind::Commit, RecordState::New, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let repo = InMemoryIngestionRecordRepository::new();
        let r = record("WEB-1");
        repo.insert_if_absent(&r).await.unwrap();

        let claimed = repo
            .transition(r.id, RecordState::New, r.last_transition_at, RecordTransition::Claim)
            .await
            .unwrap()
            .expect("first claim wins");
        assert_eq!(claimed.state, RecordState::Indexing);
        assert!(claimed.last_transition_at > r.last_transition_at);

        let lost = repo
            .transition(r.id, RecordState::New, r.last_transition_at, RecordTransition::Claim)
            .await
            .unwrap();
        assert!(lost.is_none());

        let indexed = repo
            .transition(
                r.id,
                RecordState::Indexing,
                claimed.last_transition_at,
                RecordTransition::Index {
                    stats: RecordStats::from([("chunks".to_string(), 2)]),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(indexed.stats.get("chunks"), Some(&2));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_error() {
        let repo = InMemoryIngestionRecordRepository::new();
        let r = record("WEB-1");
        repo.insert_if_absent(&r).await.unwrap();

        let err = repo
            .transition(r.id, RecordState::New, r.last_transition_at, RecordTransition::Reset)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Transition(_)));

        let err = repo
            .transition(RecordId::new(), RecordState::New, r.last_transition_at, RecordTransition::Claim)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_claims_are_found() {
        let repo = InMemoryIngestionRecordRepository::new();
        let r = record("WEB-1");
        repo.insert_if_absent(&r).await.unwrap();
        let claimed = repo
            .transition(r.id, RecordState::New, r.last_transition_at, RecordTransition::Claim)
            .await
            .unwrap()
            .unwrap();

        let none = repo
            .find_stale_claims(ResourceKind::Issue, claimed.last_transition_at, None)
            .await
            .unwrap();
        assert!(none.is_empty());

        let later = claimed.last_transition_at + Duration::seconds(1);
        let stale = repo
            .find_stale_claims(ResourceKind::Issue, later, None)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }
}
