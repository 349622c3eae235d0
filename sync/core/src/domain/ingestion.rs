// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Ingestion Record Aggregate
//!
//! An `IngestionRecord` is one unit of externally-sourced work (an issue key,
//! a commit hash) that the continuous ingestion pipeline drives until it is
//! durably indexed in the knowledge store.
//!
//! ```text
//!   NEW ──claim──▶ INDEXING ──index──▶ INDEXED
//!                     │  ▲
//!                     │  └─reclaim (stale claim)
//!                     └────fail────▶ FAILED ──reset (external)──▶ NEW
//! ```
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Record identity, lifecycle state and the legal transitions

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Derived statistics persisted with an indexed record (e.g. `chunks`).
pub type RecordStats = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of upstream resource a record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Issue,
    Commit,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Issue => "issue",
            ResourceKind::Commit => "commit",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(ResourceKind::Issue),
            "commit" => Ok(ResourceKind::Commit),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Tenant/project pair that scopes record identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant: String,
    pub project: String,
}

impl Scope {
    pub fn new(tenant: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.project)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    New,
    Indexing,
    Indexed,
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::New => "NEW",
            RecordState::Indexing => "INDEXING",
            RecordState::Indexed => "INDEXED",
            RecordState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(RecordState::New),
            "INDEXING" => Ok(RecordState::Indexing),
            "INDEXED" => Ok(RecordState::Indexed),
            "FAILED" => Ok(RecordState::Failed),
            other => Err(format!("unknown record state: {}", other)),
        }
    }
}

/// A requested lifecycle step. Applied through the repository's
/// compare-and-set so that only one writer wins.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordTransition {
    /// NEW → INDEXING. Must happen before any remote I/O.
    Claim,
    /// INDEXING → INDEXING for a claim whose owner never finished.
    Reclaim,
    /// INDEXING → INDEXED, persisting derived statistics.
    Index { stats: RecordStats },
    /// INDEXING → FAILED with an operator-facing reason.
    Fail { reason: String },
    /// FAILED → NEW. Issued by operators only, never by the pipeline.
    Reset,
}

impl RecordTransition {
    pub fn name(&self) -> &'static str {
        match self {
            RecordTransition::Claim => "claim",
            RecordTransition::Reclaim => "reclaim",
            RecordTransition::Index { .. } => "index",
            RecordTransition::Fail { .. } => "fail",
            RecordTransition::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Illegal transition '{transition}' from state {from}")]
    Illegal {
        from: RecordState,
        transition: &'static str,
    },
}

/// Current time truncated to microseconds.
///
/// Transition timestamps double as optimistic-lock versions, so they must
/// survive a PostgreSQL `timestamptz` round trip unchanged.
pub fn transition_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Timestamp for a transition out of a state stamped `previous`.
/// Strictly later than `previous`, so every successful write changes the version.
pub fn next_transition_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    transition_timestamp().max(previous + Duration::microseconds(1))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub id: RecordId,
    /// Stable external identity (issue key, commit hash). Unique within scope.
    pub source_id: String,
    pub scope: Scope,
    pub resource_kind: ResourceKind,
    pub state: RecordState,
    pub failure_reason: Option<String>,
    pub stats: RecordStats,
    /// Collector-supplied context such as `repository` and `branch`.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub discovered_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl IngestionRecord {
    pub fn new(scope: Scope, resource_kind: ResourceKind, source_id: impl Into<String>) -> Self {
        let now = transition_timestamp();
        Self {
            id: RecordId::new(),
            source_id: source_id.into(),
            scope,
            resource_kind,
            state: RecordState::New,
            failure_reason: None,
            stats: RecordStats::new(),
            attributes: HashMap::new(),
            discovered_at: now,
            last_transition_at: now,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RecordState::Indexed | RecordState::Failed)
    }

    /// Apply a transition in place, validating it against the state machine.
    pub fn apply(
        &mut self,
        transition: RecordTransition,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let illegal = TransitionError::Illegal {
            from: self.state,
            transition: transition.name(),
        };

        match (self.state, transition) {
            (RecordState::New, RecordTransition::Claim) => {
                self.state = RecordState::Indexing;
            }
            (RecordState::Indexing, RecordTransition::Reclaim) => {}
            (RecordState::Indexing, RecordTransition::Index { stats }) => {
                self.state = RecordState::Indexed;
                self.stats = stats;
                self.failure_reason = None;
            }
            (RecordState::Indexing, RecordTransition::Fail { reason }) => {
                self.state = RecordState::Failed;
                self.failure_reason = Some(reason);
            }
            (RecordState::Failed, RecordTransition::Reset) => {
                self.state = RecordState::New;
                self.failure_reason = None;
            }
            _ => return Err(illegal),
        }

        self.last_transition_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> IngestionRecord {
        IngestionRecord::new(Scope::new("acme", "web"), ResourceKind::Issue, "WEB-1")
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut r = record();
        assert_eq!(r.state, RecordState::New);

        r.apply(RecordTransition::Claim, transition_timestamp()).unwrap();
        assert_eq!(r.state, RecordState::Indexing);

        let stats = RecordStats::from([("chunks".to_string(), 3)]);
        r.apply(RecordTransition::Index { stats: stats.clone() }, transition_timestamp())
            .unwrap();
        assert_eq!(r.state, RecordState::Indexed);
        assert_eq!(r.stats, stats);
        assert!(r.is_terminal());
    }

    #[test]
    fn test_fail_then_external_reset() {
        let mut r = record();
        r.apply(RecordTransition::Claim, transition_timestamp()).unwrap();
        r.apply(
            RecordTransition::Fail { reason: "issue body unparseable".into() },
            transition_timestamp(),
        )
        .unwrap();
        assert_eq!(r.state, RecordState::Failed);
        assert_eq!(r.failure_reason.as_deref(), Some("issue body unparseable"));

        r.apply(RecordTransition::Reset, transition_timestamp()).unwrap();
        assert_eq!(r.state, RecordState::New);
        assert!(r.failure_reason.is_none());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut r = record();
        let err = r
            .apply(RecordTransition::Index { stats: RecordStats::new() }, transition_timestamp())
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal { from: RecordState::New, transition: "index" }
        );

        assert!(r.apply(RecordTransition::Reset, transition_timestamp()).is_err());
        assert!(r.apply(RecordTransition::Reclaim, transition_timestamp()).is_err());

        r.apply(RecordTransition::Claim, transition_timestamp()).unwrap();
        assert!(r.apply(RecordTransition::Claim, transition_timestamp()).is_err());
        assert_eq!(r.state, RecordState::Indexing);
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            RecordState::New,
            RecordState::Indexing,
            RecordState::Indexed,
            RecordState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<RecordState>().unwrap(), state);
        }
        assert!("DONE".parse::<RecordState>().is_err());
    }

    #[test]
    fn test_timestamps_are_microsecond_precision() {
        let ts = transition_timestamp();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_next_timestamp_is_strictly_later() {
        let future = transition_timestamp() + Duration::seconds(5);
        let next = next_transition_timestamp(future);
        assert_eq!(next, future + Duration::microseconds(1));

        let now = transition_timestamp();
        assert!(next_transition_timestamp(now) > now);
    }
}
