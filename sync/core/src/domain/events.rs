// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Domain Events - Observable state changes in the sync backbone
//
// Every breaker transition, provider (re)registration and record lifecycle
// step is published here so operators and tests can follow what happened
// without scraping logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::circuit::CircuitStatus;
use crate::domain::ingestion::{RecordId, RecordStats, ResourceKind};
use crate::domain::provider::ProviderKind;

/// Per-cycle outcome counters for one pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// NEW records claimed this cycle (overflow claims included).
    pub claimed: usize,
    /// Stale INDEXING records re-claimed this cycle.
    pub reclaimed: usize,
    pub indexed: usize,
    pub failed: usize,
    /// Records marked INDEXED without enrichment because the cycle cap was hit.
    pub overflow: usize,
    /// Records left for a later cycle (breaker open, remote busy).
    pub deferred: usize,
    /// Claims lost to another pipeline instance.
    pub skipped_claims: usize,
    pub parents_enriched: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        *self == CycleReport::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    CircuitTransitioned {
        provider: String,
        from: CircuitStatus,
        to: CircuitStatus,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    ProviderRegistered {
        provider: String,
        kind: ProviderKind,
        display_name: String,
        local: bool,
        at: DateTime<Utc>,
    },
    ProviderDiscoveryFailed {
        provider: String,
        reason: String,
        at: DateTime<Utc>,
    },
    ProviderReconnected {
        provider: String,
        generation: u64,
        at: DateTime<Utc>,
    },
    ProviderReconnectFailed {
        provider: String,
        reason: String,
        at: DateTime<Utc>,
    },
    RecordClaimed {
        record_id: RecordId,
        resource_kind: ResourceKind,
        source_id: String,
        reclaimed: bool,
        at: DateTime<Utc>,
    },
    RecordIndexed {
        record_id: RecordId,
        resource_kind: ResourceKind,
        source_id: String,
        overflow: bool,
        stats: RecordStats,
        at: DateTime<Utc>,
    },
    RecordFailed {
        record_id: RecordId,
        resource_kind: ResourceKind,
        source_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    CycleCompleted {
        resource_kind: ResourceKind,
        report: CycleReport,
        at: DateTime<Utc>,
    },
}

impl SyncEvent {
    /// Provider the event concerns, if any
    pub fn provider(&self) -> Option<&str> {
        match self {
            SyncEvent::CircuitTransitioned { provider, .. }
            | SyncEvent::ProviderRegistered { provider, .. }
            | SyncEvent::ProviderDiscoveryFailed { provider, .. }
            | SyncEvent::ProviderReconnected { provider, .. }
            | SyncEvent::ProviderReconnectFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Record the event concerns, if any
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            SyncEvent::RecordClaimed { record_id, .. }
            | SyncEvent::RecordIndexed { record_id, .. }
            | SyncEvent::RecordFailed { record_id, .. } => Some(*record_id),
            _ => None,
        }
    }
}
