// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::JobSummary;

#[async_trait]
/// Audit trail of finished jobs.
pub trait JobSummaryStorePort: Send + Sync {
    async fn insert_summary(&self, summary: &JobSummary) -> AppResult<i64>;
    async fn latest_summary(&self, name: &str) -> AppResult<Option<StoredSummary>>;
    async fn list_summaries(&self) -> AppResult<Vec<StoredSummary>>;
}

/// Summary row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSummary {
    pub id: i64,
    pub name: String,
    pub scheduler_id: Option<String>,
    pub final_state: String,
    pub remote_dir: String,
    pub retry_count: u32,
    pub bundle_hash: String,
    pub submitted_at: Option<String>,
    pub finished_at: String,
    pub failure: Option<String>,
    pub results_dir: Option<String>,
    pub metrics_json: String,
    pub history_json: String,
    pub decisions_json: String,
}
