// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Circuit state value objects shared by the breaker and its observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// Calls flow to the remote.
    Closed,
    /// Calls are refused locally without touching the remote.
    Open,
    /// A single probe call is allowed through.
    HalfOpen,
}

impl CircuitStatus {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            CircuitStatus::Closed => 0,
            CircuitStatus::Open => 1,
            CircuitStatus::HalfOpen => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitStatus::Open,
            2 => CircuitStatus::HalfOpen,
            _ => CircuitStatus::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "CLOSED",
            CircuitStatus::Open => "OPEN",
            CircuitStatus::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one named breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    /// Set iff status is OPEN or HALF_OPEN.
    pub opened_at: Option<DateTime<Utc>>,
}
