// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mod
//!
//! Aggregates, value objects and collaborator interfaces of the sync backbone.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and traits; no I/O

pub mod circuit;
pub mod events;
pub mod ingestion;
pub mod knowledge;
pub mod provider;
pub mod repository;
pub mod sync_config;
