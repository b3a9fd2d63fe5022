//! Durable Job Registry backend — a `job` table for deployments that want
//! long-running batch jobs (file uploads) to survive a process restart.
//! The full row is read-modify-written under `SELECT ... FOR UPDATE` so a
//! status-transition check and the write that acts on it never race.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS job (
//!     job_id        TEXT PRIMARY KEY,
//!     trade_id      TEXT,
//!     source        TEXT,
//!     status        TEXT NOT NULL,
//!     progress      SMALLINT NOT NULL DEFAULT 0,
//!     message       TEXT,
//!     result        JSONB,
//!     error_code    TEXT,
//!     error_message TEXT,
//!     callback_url  TEXT,
//!     created_at    TIMESTAMPTZ NOT NULL,
//!     updated_at    TIMESTAMPTZ NOT NULL
//! );
//! ```

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;

use super::{CancelOutcome, JobRegistry, JobUpdate};
use crate::domain::job::JobStatus;
use crate::domain::trade_request::Source;
use crate::domain::Job;
use crate::error::PstppError;

pub struct PostgresJobRegistry {
    pool: PgPool,
}

impl PostgresJobRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, PstppError> {
    let status: String = row.try_get("status")?;
    let source: Option<String> = row.try_get("source")?;
    Ok(Job {
        job_id: row.try_get("job_id")?,
        trade_id: row.try_get("trade_id")?,
        source: source.and_then(|s| s.parse::<Source>().ok()),
        status: parse_job_status(&status),
        progress: row.try_get::<i16, _>("progress")? as u8,
        message: row.try_get("message")?,
        result: row.try_get("result")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        callback_url: row.try_get("callback_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_job_status(s: &str) -> JobStatus {
    match s {
        "PENDING" => JobStatus::Pending,
        "PROCESSING" => JobStatus::Processing,
        "COMPLETED" => JobStatus::Completed,
        "FAILED" => JobStatus::Failed,
        "CANCELLED" => JobStatus::Cancelled,
        _ => JobStatus::Failed,
    }
}

#[async_trait]
impl JobRegistry for PostgresJobRegistry {
    async fn create(
        &self,
        job_id: String,
        trade_id: Option<String>,
        source: Option<Source>,
        callback_url: Option<String>,
    ) -> Result<Job, PstppError> {
        let job = Job::new_pending_full(job_id, trade_id, source, callback_url);
        sqlx::query(
            r#"
            INSERT INTO job
                (job_id, trade_id, source, status, progress, message, result,
                 error_code, error_message, callback_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.trade_id)
        .bind(job.source.map(|s| s.to_string()))
        .bind("PENDING")
        .bind(job.progress as i16)
        .bind(&job.message)
        .bind(&job.result)
        .bind(&job.error_code)
        .bind(&job.error_message)
        .bind(&job.callback_url)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PstppError> {
        let row = sqlx::query("SELECT * FROM job WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job, PstppError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM job WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PstppError::NotFound(format!("job {job_id}")))?;
        let mut job = row_to_job(&row)?;

        if let Some(status) = update.status {
            job.transition_to(status).map_err(|(from, to)| PstppError::InvalidStateTransition {
                partition_key: job_id.to_string(),
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            })?;
        }
        if let Some(progress) = update.progress {
            job.set_progress(progress, update.message.clone());
        } else if update.message.is_some() {
            job.message = update.message;
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        if let Some((code, message)) = update.error {
            job.error_code = Some(code);
            job.error_message = Some(message);
        }
        job.updated_at = chrono::Utc::now();

        sqlx::query(
            r#"
            UPDATE job
            SET status = $2, progress = $3, message = $4, result = $5,
                error_code = $6, error_message = $7, updated_at = $8
            WHERE job_id = $1
            "#,
        )
        .bind(&job.job_id)
        .bind(format!("{:?}", job.status).to_uppercase())
        .bind(job.progress as i16)
        .bind(&job.message)
        .bind(&job.result)
        .bind(&job.error_code)
        .bind(&job.error_message)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, PstppError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM job WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PstppError::NotFound(format!("job {job_id}")))?;
        let mut job = row_to_job(&row)?;
        if job.status != JobStatus::Pending {
            return Ok(CancelOutcome::NotCancellable);
        }
        job.transition_to(JobStatus::Cancelled)
            .expect("PENDING -> CANCELLED is always a legal transition");

        sqlx::query("UPDATE job SET status = 'CANCELLED', progress = 100, updated_at = $2 WHERE job_id = $1")
            .bind(job_id)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CancelOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    async fn test_pool() -> Option<PgPool> {
        let url = env::var("DATABASE_URL").ok()?;
        PgPool::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn create_then_cancel_round_trips_against_live_database() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set or unreachable");
            return;
        };
        let registry = PostgresJobRegistry::new(pool);
        let job_id = format!("test_job_{}", uuid::Uuid::new_v4());
        registry.create(job_id.clone(), None, None, None).await.unwrap();
        assert_eq!(registry.cancel(&job_id).await.unwrap(), CancelOutcome::Cancelled);
        let job = registry.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }
}
