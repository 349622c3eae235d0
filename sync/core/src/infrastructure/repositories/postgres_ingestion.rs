// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Ingestion Record Repository
//!
//! `IngestionRecordRepository` backed by the `ingestion_records` table via
//! `sqlx`. State transitions use optimistic locking: the `UPDATE` only
//! matches when both `state` and `last_transition_at` still hold the values
//! the caller read, so concurrent claimers in different processes resolve to
//! exactly one winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::HashMap;

use crate::domain::ingestion::{
    next_transition_timestamp, IngestionRecord, RecordId, RecordState, RecordStats,
    RecordTransition, ResourceKind, Scope,
};
use crate::domain::repository::{IngestionRecordRepository, RepositoryError};

/// Idempotent DDL for the ingestion tables
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ingestion_records (
    id                  UUID PRIMARY KEY,
    tenant              TEXT NOT NULL,
    project             TEXT NOT NULL,
    resource_kind       TEXT NOT NULL,
    source_id           TEXT NOT NULL,
    state               TEXT NOT NULL,
    failure_reason      TEXT,
    stats               JSONB NOT NULL DEFAULT '{}'::jsonb,
    attributes          JSONB NOT NULL DEFAULT '{}'::jsonb,
    discovered_at       TIMESTAMPTZ NOT NULL,
    last_transition_at  TIMESTAMPTZ NOT NULL,
    CONSTRAINT ingestion_records_source_unique UNIQUE (tenant, project, resource_kind, source_id)
);

CREATE INDEX IF NOT EXISTS idx_ingestion_records_kind_state
    ON ingestion_records (resource_kind, state, discovered_at);
"#;

const SELECT_COLUMNS: &str = "id, tenant, project, resource_kind, source_id, state, failure_reason, \
     stats, attributes, discovered_at, last_transition_at";

pub struct PostgresIngestionRecordRepository {
    pool: PgPool,
}

impl PostgresIngestionRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &PgRow) -> Result<IngestionRecord, RepositoryError> {
        let id: uuid::Uuid = row.try_get("id")?;
        let resource_kind: String = row.try_get("resource_kind")?;
        let state: String = row.try_get("state")?;
        let stats: serde_json::Value = row.try_get("stats")?;
        let attributes: serde_json::Value = row.try_get("attributes")?;

        Ok(IngestionRecord {
            id: RecordId(id),
            source_id: row.try_get("source_id")?,
            scope: Scope::new(
                row.try_get::<String, _>("tenant")?,
                row.try_get::<String, _>("project")?,
            ),
            resource_kind: resource_kind
                .parse()
                .map_err(RepositoryError::Serialization)?,
            state: state.parse().map_err(RepositoryError::Serialization)?,
            failure_reason: row.try_get("failure_reason")?,
            stats: serde_json::from_value::<RecordStats>(stats)?,
            attributes: serde_json::from_value::<HashMap<String, String>>(attributes)?,
            discovered_at: row.try_get("discovered_at")?,
            last_transition_at: row.try_get("last_transition_at")?,
        })
    }
}

#[async_trait]
impl IngestionRecordRepository for PostgresIngestionRecordRepository {
    async fn insert_if_absent(&self, record: &IngestionRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_records (
                id, tenant, project, resource_kind, source_id, state,
                failure_reason, stats, attributes, discovered_at, last_transition_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.id.0)
        .bind(&record.scope.tenant)
        .bind(&record.scope.project)
        .bind(record.resource_kind.as_str())
        .bind(&record.source_id)
        .bind(record.state.as_str())
        .bind(&record.failure_reason)
        .bind(serde_json::to_value(&record.stats)?)
        .bind(serde_json::to_value(&record.attributes)?)
        .bind(record.discovered_at)
        .bind(record.last_transition_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert ingestion record: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, id: RecordId) -> Result<Option<IngestionRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_records WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find_by_source(
        &self,
        scope: &Scope,
        resource_kind: ResourceKind,
        source_id: &str,
    ) -> Result<Option<IngestionRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_records \
             WHERE tenant = $1 AND project = $2 AND resource_kind = $3 AND source_id = $4",
            SELECT_COLUMNS
        ))
        .bind(&scope.tenant)
        .bind(&scope.project)
        .bind(resource_kind.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find_by_state(
        &self,
        resource_kind: ResourceKind,
        state: RecordState,
        limit: Option<usize>,
    ) -> Result<Vec<IngestionRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_records \
             WHERE resource_kind = $1 AND state = $2 \
             ORDER BY discovered_at ASC, source_id ASC \
             LIMIT $3",
            SELECT_COLUMNS
        ))
        .bind(resource_kind.as_str())
        .bind(state.as_str())
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn find_stale_claims(
        &self,
        resource_kind: ResourceKind,
        claimed_before: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<IngestionRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_records \
             WHERE resource_kind = $1 AND state = $2 AND last_transition_at < $3 \
             ORDER BY discovered_at ASC, source_id ASC \
             LIMIT $4",
            SELECT_COLUMNS
        ))
        .bind(resource_kind.as_str())
        .bind(RecordState::Indexing.as_str())
        .bind(claimed_before)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn transition(
        &self,
        id: RecordId,
        expected_state: RecordState,
        expected_transition_at: DateTime<Utc>,
        transition: RecordTransition,
    ) -> Result<Option<IngestionRecord>, RepositoryError> {
        let current = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("ingestion record {}", id)))?;

        if current.state != expected_state || current.last_transition_at != expected_transition_at {
            return Ok(None);
        }

        let mut updated = current;
        updated.apply(transition, next_transition_timestamp(expected_transition_at))?;

        let result = sqlx::query(
            r#"
            UPDATE ingestion_records
            SET state = $4,
                failure_reason = $5,
                stats = $6,
                last_transition_at = $7
            WHERE id = $1 AND state = $2 AND last_transition_at = $3
            "#,
        )
        .bind(id.0)
        .bind(expected_state.as_str())
        .bind(expected_transition_at)
        .bind(updated.state.as_str())
        .bind(&updated.failure_reason)
        .bind(serde_json::to_value(&updated.stats)?)
        .bind(updated.last_transition_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to transition ingestion record: {}", e)))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_enforces_source_uniqueness() {
        assert!(SCHEMA.contains("UNIQUE (tenant, project, resource_kind, source_id)"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS ingestion_records"));
    }

    #[test]
    fn test_select_columns_cover_record_fields() {
        for column in [
            "id",
            "tenant",
            "project",
            "resource_kind",
            "source_id",
            "state",
            "failure_reason",
            "stats",
            "attributes",
            "discovered_at",
            "last_transition_at",
        ] {
            assert!(SELECT_COLUMNS.contains(column), "{column}");
        }
    }
}
