// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;

use crate::app::ports::summary_store::StoredSummary;
use crate::app::types::JobSummary;

#[derive(Debug, Error)]
pub enum SummaryStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("timestamp formatting error: {0}")]
    Time(#[from] time::error::Format),
    #[error("empty job name")]
    EmptyName,
}

pub type Result<T> = std::result::Result<T, SummaryStoreError>;

/// Append-only table of finished jobs.
#[derive(Clone)]
pub struct SummaryStore {
    pool: SqlitePool,
}

impl SummaryStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    #[allow(dead_code)]
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        // A second connection would see a different in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_summaries (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              scheduler_id TEXT,
              final_state TEXT NOT NULL,
              remote_dir TEXT NOT NULL,
              retry_count INTEGER NOT NULL,
              bundle_hash TEXT NOT NULL,
              submitted_at TEXT,
              finished_at TEXT NOT NULL,
              failure TEXT,
              results_dir TEXT,
              metrics_json TEXT NOT NULL,
              history_json TEXT NOT NULL,
              decisions_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_job_summaries_name ON job_summaries(name);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_summary(&self, summary: &JobSummary) -> Result<i64> {
        if summary.name.trim().is_empty() {
            return Err(SummaryStoreError::EmptyName);
        }
        let submitted_at = summary
            .submitted_at
            .map(|at| at.format(&Rfc3339))
            .transpose()?;
        let finished_at = summary.finished_at.format(&Rfc3339)?;
        let metrics_json = serde_json::to_string(&summary.metrics)?;
        let history_json = serde_json::to_string(&summary.history)?;
        let decisions_json = serde_json::to_string(&summary.decisions)?;

        let res = sqlx::query(
            r#"
            INSERT INTO job_summaries (
              name, scheduler_id, final_state, remote_dir, retry_count, bundle_hash,
              submitted_at, finished_at, failure, results_dir,
              metrics_json, history_json, decisions_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.name)
        .bind(summary.scheduler_id.as_deref())
        .bind(summary.final_state.as_str())
        .bind(&summary.remote_dir)
        .bind(i64::from(summary.retry_count))
        .bind(&summary.bundle_hash)
        .bind(submitted_at)
        .bind(finished_at)
        .bind(summary.failure.as_deref())
        .bind(summary.results_dir.as_deref())
        .bind(metrics_json)
        .bind(history_json)
        .bind(decisions_json)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Most recent summary for `name`, if any.
    pub async fn latest_summary(&self, name: &str) -> Result<Option<StoredSummary>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM job_summaries
            WHERE name = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_summary(&row)).transpose()
    }

    pub async fn list_summaries(&self) -> Result<Vec<StoredSummary>> {
        let rows = sqlx::query("SELECT * FROM job_summaries ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_summary).collect()
    }
}

fn row_to_summary(row: &SqliteRow) -> Result<StoredSummary> {
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(StoredSummary {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        scheduler_id: row.try_get("scheduler_id")?,
        final_state: row.try_get("final_state")?,
        remote_dir: row.try_get("remote_dir")?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        bundle_hash: row.try_get("bundle_hash")?,
        submitted_at: row.try_get("submitted_at")?,
        finished_at: row.try_get("finished_at")?,
        failure: row.try_get("failure")?,
        results_dir: row.try_get("results_dir")?,
        metrics_json: row.try_get("metrics_json")?,
        history_json: row.try_get("history_json")?,
        decisions_json: row.try_get("decisions_json")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::{DecisionRecord, JobState, StateTransition};
    use std::collections::BTreeMap;
    use time::macros::datetime;

    fn summary(name: &str, state: JobState, failure: Option<&str>) -> JobSummary {
        let at = datetime!(2026-03-01 12:00 UTC);
        JobSummary {
            name: name.into(),
            scheduler_id: Some("4242".into()),
            final_state: state,
            remote_dir: format!("/scratch/alice/{name}"),
            bundle_hash: "ab12".into(),
            submitted_at: Some(at),
            finished_at: datetime!(2026-03-01 14:30 UTC),
            retry_count: 1,
            metrics: BTreeMap::from([("free_energy_ev".to_string(), -10.5)]),
            history: vec![StateTransition {
                from: JobState::Prepared,
                to: JobState::Submitted,
                at,
                reason: "accepted as 4242".into(),
            }],
            decisions: vec![DecisionRecord {
                attempt: 0,
                plan: "resubmit_unchanged".into(),
                reason: "walltime".into(),
                at,
            }],
            failure: failure.map(str::to_string),
            results_dir: None,
        }
    }

    #[tokio::test]
    async fn insert_and_read_back_latest() {
        let db = SummaryStore::open_memory().await.unwrap();
        db.insert_summary(&summary("si", JobState::Failed, Some("recovery exhausted")))
            .await
            .unwrap();
        let id = db
            .insert_summary(&summary("si", JobState::Succeeded, None))
            .await
            .unwrap();

        let got = db.latest_summary("si").await.unwrap().unwrap();
        assert_eq!(got.id, id);
        assert_eq!(got.final_state, "succeeded");
        assert_eq!(got.failure, None);
        assert_eq!(got.retry_count, 1);
        assert_eq!(got.submitted_at.as_deref(), Some("2026-03-01T12:00:00Z"));

        let metrics: BTreeMap<String, f64> = serde_json::from_str(&got.metrics_json).unwrap();
        assert_eq!(metrics["free_energy_ev"], -10.5);
        let history: serde_json::Value = serde_json::from_str(&got.history_json).unwrap();
        assert_eq!(history[0]["to"], "submitted");
    }

    #[tokio::test]
    async fn failures_are_recorded_too() {
        let db = SummaryStore::open_memory().await.unwrap();
        db.insert_summary(&summary("fe", JobState::Failed, Some("unrecoverable failure: ZBRENT")))
            .await
            .unwrap();
        let all = db.list_summaries().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].final_state, "failed");
        assert!(all[0].failure.as_deref().unwrap().contains("ZBRENT"));
    }

    #[tokio::test]
    async fn unknown_name_has_no_summary() {
        let db = SummaryStore::open_memory().await.unwrap();
        assert!(db.latest_summary("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let db = SummaryStore::open_memory().await.unwrap();
        let err = db
            .insert_summary(&summary(" ", JobState::Failed, None))
            .await
            .unwrap_err();
        assert!(matches!(err, SummaryStoreError::EmptyName));
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobctl.db");
        {
            let db = SummaryStore::open(&path).await.unwrap();
            db.insert_summary(&summary("si", JobState::Succeeded, None))
                .await
                .unwrap();
        }
        let db = SummaryStore::open(&path).await.unwrap();
        assert_eq!(db.list_summaries().await.unwrap().len(), 1);
    }
}
