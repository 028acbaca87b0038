// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::db::{SummaryStore, SummaryStoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::JobSummaryStorePort;
use crate::app::ports::summary_store::StoredSummary;
use crate::app::types::JobSummary;

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<SummaryStore>,
}

impl SqliteStoreAdapter {
    pub fn new(store: SummaryStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

fn map_store_error(err: SummaryStoreError) -> AppError {
    match err {
        SummaryStoreError::EmptyName => AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            "job summary has an empty name",
        ),
        other => AppError::with_message(
            AppErrorKind::Internal,
            codes::LOCAL_ERROR,
            format!("summary store: {other}"),
        ),
    }
}

#[async_trait]
impl JobSummaryStorePort for SqliteStoreAdapter {
    async fn insert_summary(&self, summary: &JobSummary) -> AppResult<i64> {
        self.store
            .insert_summary(summary)
            .await
            .map_err(map_store_error)
    }

    async fn latest_summary(&self, name: &str) -> AppResult<Option<StoredSummary>> {
        self.store
            .latest_summary(name)
            .await
            .map_err(map_store_error)
    }

    async fn list_summaries(&self) -> AppResult<Vec<StoredSummary>> {
        self.store.list_summaries().await.map_err(map_store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_maps_to_invalid_argument() {
        let err = map_store_error(SummaryStoreError::EmptyName);
        assert_eq!(err.code(), codes::INVALID_ARGUMENT);
    }

    #[test]
    fn database_errors_are_local() {
        let err = map_store_error(SummaryStoreError::Sqlx(sqlx::Error::RowNotFound));
        assert_eq!(err.code(), codes::LOCAL_ERROR);
        assert!(!err.is_transient());
    }
}
