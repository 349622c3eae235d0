// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Resilient continuous-synchronization backbone: circuit breakers, per-domain
//! rate limiting, a reconnecting provider client registry and the continuous
//! ingestion pipelines built on top of them.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Implements lib

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
