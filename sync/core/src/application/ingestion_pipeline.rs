// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Continuous Ingestion Pipeline - Background task driving records to INDEXED
//!
//! One pipeline runs per resource kind. Each cycle:
//!
//! 1. re-claims abandoned INDEXING records (claim older than `claim_timeout`),
//! 2. claims NEW records oldest-first up to `max_records_per_cycle`, running the
//!    one-time parent enrichment for every parent seen for the first time,
//! 3. processes each claimed record and marks it INDEXED or FAILED,
//! 4. drains NEW records beyond the cap by marking them INDEXED without
//!    enrichment (overflow).
//!
//! Every record is claimed before any remote I/O is done for it, so pipeline
//! instances sharing a store never process the same record concurrently.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Resumable, crash-safe record lifecycle driver

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::events::{CycleReport, SyncEvent};
use crate::domain::ingestion::{
    IngestionRecord, RecordState, RecordStats, RecordTransition, ResourceKind,
};
use crate::domain::knowledge::KnowledgeStoreError;
use crate::domain::repository::{IngestionRecordRepository, RepositoryError};
use crate::domain::sync_config::PipelineConfig;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::registry::RegistryError;

/// Outcome of enriching a single record or parent
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    /// Retry in a later cycle: the claim is left to expire.
    #[error("Deferred: {0}")]
    Deferred(String),

    /// Unrecoverable: the record is marked FAILED with this reason.
    #[error("{0}")]
    Failed(String),
}

impl From<RegistryError> for ProcessingError {
    fn from(err: RegistryError) -> Self {
        if err.is_retry_later() {
            ProcessingError::Deferred(err.to_string())
        } else {
            ProcessingError::Failed(err.to_string())
        }
    }
}

impl From<KnowledgeStoreError> for ProcessingError {
    fn from(err: KnowledgeStoreError) -> Self {
        if err.is_retry_later() {
            ProcessingError::Deferred(err.to_string())
        } else {
            ProcessingError::Failed(err.to_string())
        }
    }
}

/// Resource-kind specific enrichment plugged into the pipeline
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    fn resource_kind(&self) -> ResourceKind;

    /// Records sharing a parent get one `enrich_parent` call before the first
    /// of them is processed.
    fn parent_key(&self, _record: &IngestionRecord) -> Option<String> {
        None
    }

    async fn enrich_parent(
        &self,
        _parent: &str,
        _records: &[IngestionRecord],
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Pre-claim check. Records not admitted stay NEW for a later cycle.
    fn admits(&self, _record: &IngestionRecord) -> bool {
        true
    }

    /// Fetch, chunk and store the record. Returns the stats persisted on INDEXED.
    async fn process(&self, record: &IngestionRecord) -> Result<RecordStats, ProcessingError>;
}

struct Candidate {
    record: IngestionRecord,
    stale: bool,
}

pub struct ContinuousIngestionPipeline {
    repository: Arc<dyn IngestionRecordRepository>,
    processor: Arc<dyn RecordProcessor>,
    config: PipelineConfig,
    event_bus: Option<EventBus>,
    enriched_parents: Mutex<HashSet<String>>,
    shutdown_token: CancellationToken,
}

impl ContinuousIngestionPipeline {
    pub fn new(
        repository: Arc<dyn IngestionRecordRepository>,
        processor: Arc<dyn RecordProcessor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            repository,
            processor,
            config,
            event_bus: None,
            enriched_parents: Mutex::new(HashSet::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Use an externally owned token (e.g. one child token per pipeline)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn resource_kind(&self) -> ResourceKind {
        self.processor.resource_kind()
    }

    /// Start the pipeline background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Cycle loop. A failed or panicking cycle is logged and the loop continues.
    async fn run(self: Arc<Self>) {
        let kind = self.resource_kind();
        if !self.config.enabled {
            info!(resource_kind = %kind, "Ingestion pipeline is disabled");
            return;
        }

        info!(
            resource_kind = %kind,
            startup_delay_seconds = self.config.startup_delay_seconds,
            cycle_interval_seconds = self.config.cycle_interval_seconds,
            max_records_per_cycle = self.config.max_records_per_cycle,
            "Starting ingestion pipeline"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.config.startup_delay()) => {}
            _ = self.shutdown_token.cancelled() => {
                info!(resource_kind = %kind, "Shutdown before first cycle, stopping ingestion pipeline");
                return;
            }
        }

        loop {
            let pipeline = self.clone();
            let mut cycle = tokio::spawn(async move { pipeline.run_cycle().await });

            tokio::select! {
                joined = &mut cycle => match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(resource_kind = %kind, error = %e, "Ingestion cycle failed"),
                    Err(e) if e.is_panic() => error!(resource_kind = %kind, "Ingestion cycle panicked: {}", e),
                    Err(e) => warn!(resource_kind = %kind, "Ingestion cycle aborted: {}", e),
                },
                _ = self.shutdown_token.cancelled() => {
                    cycle.abort();
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.cycle_interval()) => {}
                _ = self.shutdown_token.cancelled() => break,
            }
        }

        info!(resource_kind = %kind, "Ingestion pipeline stopped");
    }

    /// Execute a single cycle
    pub async fn run_cycle(&self) -> Result<CycleReport, RepositoryError> {
        let kind = self.resource_kind();
        let cap = self.config.max_records_per_cycle;
        let mut report = CycleReport::default();

        let timeout = chrono::Duration::from_std(self.config.claim_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let stale = self
            .repository
            .find_stale_claims(kind, Utc::now() - timeout, Some(cap))
            .await?;
        let fresh = self
            .repository
            .find_by_state(kind, RecordState::New, None)
            .await?;

        let budget = cap.saturating_sub(stale.len());
        let (full, overflow) = if fresh.len() > budget {
            let mut fresh = fresh;
            let overflow = fresh.split_off(budget);
            (fresh, overflow)
        } else {
            (fresh, Vec::new())
        };

        let candidates: Vec<Candidate> = stale
            .into_iter()
            .map(|record| Candidate { record, stale: true })
            .chain(full.into_iter().map(|record| Candidate { record, stale: false }))
            .collect();

        for (parent, members) in self.group_by_parent(candidates) {
            self.process_group(parent, members, &mut report).await;
        }

        if !overflow.is_empty() {
            warn!(
                resource_kind = %kind,
                overflow = overflow.len(),
                max_records_per_cycle = cap,
                "Cycle cap exceeded, indexing overflow records without enrichment"
            );
            for record in &overflow {
                self.drain_overflow(record, &mut report).await;
            }
        }

        if report.is_idle() {
            debug!(resource_kind = %kind, "Ingestion cycle found no work");
        } else {
            info!(
                resource_kind = %kind,
                claimed = report.claimed,
                reclaimed = report.reclaimed,
                indexed = report.indexed,
                failed = report.failed,
                overflow = report.overflow,
                deferred = report.deferred,
                skipped_claims = report.skipped_claims,
                parents_enriched = report.parents_enriched,
                "Ingestion cycle completed"
            );
        }
        self.publish(SyncEvent::CycleCompleted {
            resource_kind: kind,
            report: report.clone(),
            at: Utc::now(),
        });

        Ok(report)
    }

    /// Groups keep the oldest-first order of their first member.
    fn group_by_parent(&self, candidates: Vec<Candidate>) -> Vec<(Option<String>, Vec<Candidate>)> {
        let mut groups: Vec<(Option<String>, Vec<Candidate>)> = Vec::new();
        for candidate in candidates {
            match self.processor.parent_key(&candidate.record) {
                Some(parent) => {
                    let existing = groups
                        .iter()
                        .position(|(key, _)| key.as_deref() == Some(parent.as_str()));
                    match existing {
                        Some(index) => groups[index].1.push(candidate),
                        None => groups.push((Some(parent), vec![candidate])),
                    }
                }
                None => groups.push((None, vec![candidate])),
            }
        }
        groups
    }

    async fn process_group(
        &self,
        parent: Option<String>,
        members: Vec<Candidate>,
        report: &mut CycleReport,
    ) {
        let mut claimed = Vec::with_capacity(members.len());
        for candidate in members {
            if !self.processor.admits(&candidate.record) {
                debug!(source_id = %candidate.record.source_id, "Record not admitted, deferring");
                report.deferred += 1;
                continue;
            }
            if let Some(record) = self.claim(&candidate.record, candidate.stale, report).await {
                claimed.push(record);
            }
        }
        if claimed.is_empty() {
            return;
        }

        if let Some(parent) = parent {
            if !self.parent_enriched(&parent) {
                match self.enrich_parent(&parent, &claimed).await {
                    Ok(()) => {
                        self.mark_parent_enriched(&parent);
                        report.parents_enriched += 1;
                    }
                    Err(ProcessingError::Failed(reason)) => {
                        warn!(parent = %parent, reason = %reason, "Parent enrichment failed, continuing with records");
                        self.mark_parent_enriched(&parent);
                    }
                    Err(ProcessingError::Deferred(reason)) => {
                        info!(
                            parent = %parent,
                            reason = %reason,
                            records = claimed.len(),
                            "Parent enrichment deferred, records will be re-claimed later"
                        );
                        report.deferred += claimed.len();
                        return;
                    }
                }
            }
        }

        for record in claimed {
            self.process_record(record, report).await;
        }
    }

    async fn enrich_parent(
        &self,
        parent: &str,
        records: &[IngestionRecord],
    ) -> Result<(), ProcessingError> {
        AssertUnwindSafe(self.processor.enrich_parent(parent, records))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ProcessingError::Failed("parent enrichment panicked".to_string())))
    }

    async fn process_record(&self, record: IngestionRecord, report: &mut CycleReport) {
        let outcome = AssertUnwindSafe(self.processor.process(&record))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ProcessingError::Failed("record processor panicked".to_string())));

        match outcome {
            Ok(stats) => {
                if self.finish(&record, RecordTransition::Index { stats }, false).await {
                    report.indexed += 1;
                }
            }
            Err(ProcessingError::Deferred(reason)) => {
                info!(
                    record_id = %record.id,
                    source_id = %record.source_id,
                    reason = %reason,
                    "Record processing deferred"
                );
                report.deferred += 1;
            }
            Err(ProcessingError::Failed(reason)) => {
                if self.finish(&record, RecordTransition::Fail { reason }, false).await {
                    report.failed += 1;
                }
            }
        }
    }

    async fn drain_overflow(&self, record: &IngestionRecord, report: &mut CycleReport) {
        if let Some(claimed) = self.claim(record, false, report).await {
            let stats = RecordStats::from([("overflow".to_string(), 1)]);
            if self.finish(&claimed, RecordTransition::Index { stats }, true).await {
                report.overflow += 1;
            }
        }
    }

    /// NEW→INDEXING (or a stale INDEXING re-claim). `None` when another
    /// instance won the race or the store refused the write.
    async fn claim(
        &self,
        record: &IngestionRecord,
        stale: bool,
        report: &mut CycleReport,
    ) -> Option<IngestionRecord> {
        let (expected, transition) = if stale {
            (RecordState::Indexing, RecordTransition::Reclaim)
        } else {
            (RecordState::New, RecordTransition::Claim)
        };

        match self
            .repository
            .transition(record.id, expected, record.last_transition_at, transition)
            .await
        {
            Ok(Some(claimed)) => {
                if stale {
                    report.reclaimed += 1;
                    warn!(record_id = %claimed.id, source_id = %claimed.source_id, "Re-claimed abandoned record");
                } else {
                    report.claimed += 1;
                    debug!(record_id = %claimed.id, source_id = %claimed.source_id, "Claimed record");
                }
                self.publish(SyncEvent::RecordClaimed {
                    record_id: claimed.id,
                    resource_kind: claimed.resource_kind,
                    source_id: claimed.source_id.clone(),
                    reclaimed: stale,
                    at: claimed.last_transition_at,
                });
                Some(claimed)
            }
            Ok(None) => {
                debug!(record_id = %record.id, source_id = %record.source_id, "Claim lost to another instance");
                report.skipped_claims += 1;
                None
            }
            Err(e) => {
                error!(record_id = %record.id, source_id = %record.source_id, error = %e, "Failed to claim record");
                None
            }
        }
    }

    /// INDEXING→INDEXED/FAILED. Returns whether the write landed.
    async fn finish(&self, record: &IngestionRecord, transition: RecordTransition, overflow: bool) -> bool {
        let outcome = match &transition {
            RecordTransition::Index { .. } if overflow => "overflow",
            RecordTransition::Index { .. } => "indexed",
            _ => "failed",
        };

        match self
            .repository
            .transition(record.id, RecordState::Indexing, record.last_transition_at, transition)
            .await
        {
            Ok(Some(updated)) => {
                metrics::counter!(
                    "aegis_sync_records_total",
                    "kind" => updated.resource_kind.as_str(),
                    "outcome" => outcome
                )
                .increment(1);

                let event = match updated.state {
                    RecordState::Failed => {
                        let reason = updated.failure_reason.clone().unwrap_or_default();
                        warn!(record_id = %updated.id, source_id = %updated.source_id, reason = %reason, "Record failed");
                        SyncEvent::RecordFailed {
                            record_id: updated.id,
                            resource_kind: updated.resource_kind,
                            source_id: updated.source_id.clone(),
                            reason,
                            at: updated.last_transition_at,
                        }
                    }
                    _ => {
                        info!(record_id = %updated.id, source_id = %updated.source_id, overflow, "Record indexed");
                        SyncEvent::RecordIndexed {
                            record_id: updated.id,
                            resource_kind: updated.resource_kind,
                            source_id: updated.source_id.clone(),
                            overflow,
                            stats: updated.stats.clone(),
                            at: updated.last_transition_at,
                        }
                    }
                };
                self.publish(event);
                true
            }
            Ok(None) => {
                warn!(record_id = %record.id, source_id = %record.source_id, "Claim expired before completion, result discarded");
                false
            }
            Err(e) => {
                error!(record_id = %record.id, source_id = %record.source_id, error = %e, "Failed to persist record outcome");
                false
            }
        }
    }

    fn parent_enriched(&self, parent: &str) -> bool {
        self.enriched_parents.lock().contains(parent)
    }

    fn mark_parent_enriched(&self, parent: &str) {
        self.enriched_parents.lock().insert(parent.to_string());
    }

    fn publish(&self, event: SyncEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}
