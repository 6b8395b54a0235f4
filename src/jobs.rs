//! Persistent job lifecycle.
//!
//! Jobs move `queued → running → {succeeded, failed, canceled}`, or straight
//! from `queued` to `failed`/`canceled`. Every transition is one conditional
//! `UPDATE` whose `WHERE state IN (...)` clause lists the legal source
//! states, so an illegal transition simply matches no row and a concurrent
//! cancel cannot be overwritten by a late completion.

use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Job, JobKind, JobState};

const JOB_COLUMNS: &str = "id, kind, params_json, state, progress, current, total, succeeded, \
     failed, error, created_at, started_at, finished_at";

/// Number of recent succeeded jobs averaged by [`JobManager::statistics`].
const RECENT_DURATION_SAMPLE: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct JobStatistics {
    pub total: i64,
    pub by_state: BTreeMap<String, i64>,
    pub by_kind: BTreeMap<String, i64>,
    /// Mean duration in seconds over recent succeeded jobs.
    pub avg_duration_secs: Option<f64>,
}

#[derive(Clone)]
pub struct JobManager {
    pool: SqlitePool,
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    let params_json: String = row.get("params_json");
    Ok(Job {
        id: row.get("id"),
        kind: kind.parse()?,
        params: serde_json::from_str(&params_json).unwrap_or(serde_json::json!({})),
        state: state.parse()?,
        progress: row.get("progress"),
        current: row.get("current"),
        total: row.get("total"),
        succeeded: row.get("succeeded"),
        failed: row.get("failed"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

/// `'a', 'b'` for use inside `IN (...)`. Only ever fed fixed state names.
fn state_list(states: &[JobState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl JobManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_job(&self, kind: JobKind, params: &serde_json::Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO jobs (id, kind, params_json, state, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(params.to_string())
        .bind(JobState::Queued.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        info!(job_id = %id, kind = %kind, "job created");
        Ok(id)
    }

    /// Move a job to `state`. Returns `false` (and changes nothing) when the
    /// job does not exist or the transition is not legal from its current
    /// state.
    pub async fn update_state(
        &self,
        id: &str,
        state: JobState,
        error: Option<&str>,
    ) -> Result<bool> {
        let sources = state.legal_sources();
        if sources.is_empty() {
            return Ok(false);
        }
        let now = chrono::Utc::now().timestamp();

        let sql = format!(
            r#"
            UPDATE jobs SET
                state = ?1,
                error = COALESCE(?2, error),
                started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?3) ELSE started_at END,
                finished_at = CASE WHEN ?4 THEN ?3 ELSE finished_at END
            WHERE id = ?5 AND state IN ({})
            "#,
            state_list(sources)
        );
        let result = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(error)
            .bind(now)
            .bind(state.is_terminal())
            .bind(id)
            .execute(&self.pool)
            .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            debug!(job_id = %id, state = %state, "job state updated");
        } else {
            debug!(job_id = %id, state = %state, "job state transition rejected");
        }
        Ok(applied)
    }

    /// Record progress. Counters only move forward; `progress` is
    /// `current / total`, or 0 when `total` is 0.
    pub async fn update_progress(
        &self,
        id: &str,
        current: i64,
        total: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                current = MAX(current, ?1),
                total = MAX(total, ?2),
                succeeded = MAX(succeeded, ?3),
                failed = MAX(failed, ?4),
                progress = CASE WHEN MAX(total, ?2) > 0
                    THEN CAST(MAX(current, ?1) AS REAL) / MAX(total, ?2)
                    ELSE 0 END
            WHERE id = ?5
            "#,
        )
        .bind(current)
        .bind(total)
        .bind(succeeded)
        .bind(failed)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel a queued or running job. Returns `false` for finished or
    /// unknown jobs.
    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        let applied = self.update_state(id, JobState::Canceled, None).await?;
        if applied {
            info!(job_id = %id, "job canceled");
        }
        Ok(applied)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn is_canceled(&self, id: &str) -> Result<bool> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(state.as_deref() == Some(JobState::Canceled.as_str()))
    }

    /// Newest first.
    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE (?1 IS NULL OR state = ?1) ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            JOB_COLUMNS
        ))
        .bind(state.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE state IN ('queued', 'running') ORDER BY created_at",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Delete finished jobs whose `finished_at` is older than `older_than`.
    pub async fn cleanup_finished(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - older_than.num_seconds();
        let result = sqlx::query(
            "DELETE FROM jobs WHERE state IN ('succeeded', 'failed', 'canceled') AND finished_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "cleaned up finished jobs");
        }
        Ok(removed)
    }

    pub async fn statistics(&self) -> Result<JobStatistics> {
        let mut by_state = BTreeMap::new();
        let mut total = 0;
        for row in sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?
        {
            let n: i64 = row.get("n");
            total += n;
            by_state.insert(row.get::<String, _>("state"), n);
        }

        let mut by_kind = BTreeMap::new();
        for row in sqlx::query("SELECT kind, COUNT(*) AS n FROM jobs GROUP BY kind")
            .fetch_all(&self.pool)
            .await?
        {
            by_kind.insert(row.get::<String, _>("kind"), row.get::<i64, _>("n"));
        }

        let avg_duration_secs: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(finished_at - started_at) FROM (
                SELECT started_at, finished_at FROM jobs
                WHERE state = 'succeeded' AND started_at IS NOT NULL AND finished_at IS NOT NULL
                ORDER BY finished_at DESC LIMIT ?
            )
            "#,
        )
        .bind(RECENT_DURATION_SAMPLE)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobStatistics {
            total,
            by_state,
            by_kind,
            avg_duration_secs,
        })
    }
}
