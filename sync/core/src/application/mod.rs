// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod commit_ingestion;
pub mod ingestion_pipeline;
pub mod issue_ingestion;

pub use commit_ingestion::CommitRecordProcessor;
pub use ingestion_pipeline::{ContinuousIngestionPipeline, ProcessingError, RecordProcessor};
pub use issue_ingestion::IssueRecordProcessor;
