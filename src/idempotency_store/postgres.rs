//! Durable L2 backend — the `idempotency_record` table.
//!
//! `mark_completed`/`mark_failed` each run against a connection checked out
//! fresh from the pool rather than inside whatever transaction the caller's
//! pipeline commit is using, so a deadlock on the main commit cannot corrupt
//! dedupe state (spec.md §5).
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS idempotency_record (
//!     idempotency_key TEXT PRIMARY KEY,
//!     trade_id        TEXT NOT NULL,
//!     partition_key   TEXT NOT NULL,
//!     status          TEXT NOT NULL,
//!     blotter_ref     TEXT,
//!     created_at      TIMESTAMPTZ NOT NULL,
//!     completed_at    TIMESTAMPTZ,
//!     expires_at      TIMESTAMPTZ NOT NULL,
//!     archive_flag    BOOLEAN NOT NULL DEFAULT FALSE
//! );
//! CREATE UNIQUE INDEX IF NOT EXISTS idempotency_record_live_key
//!     ON idempotency_record (idempotency_key) WHERE NOT archive_flag;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::IdempotencyRecordStore;
use crate::domain::{IdempotencyRecord, IdempotencyStatus};
use crate::error::PstppError;

pub struct PostgresIdempotencyRecords {
    pool: PgPool,
}

impl PostgresIdempotencyRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyRecordStore for PostgresIdempotencyRecords {
    async fn insert_processing(&self, record: IdempotencyRecord) -> Result<bool, PstppError> {
        // The partial unique index only covers live rows, so a prior
        // archived row for the same key does not block re-insertion; an
        // existing live row raises a unique-violation, which we translate
        // to `Ok(false)` (DUPLICATE) rather than propagating as an error.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_record
                (idempotency_key, trade_id, partition_key, status, blotter_ref,
                 created_at, completed_at, expires_at, archive_flag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(&record.trade_id)
        .bind(&record.partition_key)
        .bind(record.status.as_str())
        .bind(&record.blotter_ref)
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.expires_at)
        .bind(record.archive_flag)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>, PstppError> {
        let row = sqlx::query_as::<
            _,
            (String, String, String, String, Option<String>, DateTime<Utc>, Option<DateTime<Utc>>, DateTime<Utc>, bool),
        >(
            r#"
            SELECT idempotency_key, trade_id, partition_key, status, blotter_ref,
                   created_at, completed_at, expires_at, archive_flag
            FROM idempotency_record
            WHERE idempotency_key = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(idempotency_key, trade_id, partition_key, status, blotter_ref, created_at, completed_at, expires_at, archive_flag)| {
                IdempotencyRecord {
                    idempotency_key,
                    trade_id,
                    partition_key,
                    status: IdempotencyStatus::from_str_opt(&status).unwrap_or(IdempotencyStatus::Failed),
                    blotter_ref,
                    created_at,
                    completed_at,
                    expires_at,
                    archive_flag,
                }
            },
        ))
    }

    async fn mark_completed(&self, idempotency_key: &str, blotter_ref: &str) -> Result<(), PstppError> {
        sqlx::query(
            r#"
            UPDATE idempotency_record
            SET status = 'COMPLETED', blotter_ref = $2, completed_at = now()
            WHERE idempotency_key = $1 AND NOT archive_flag
            "#,
        )
        .bind(idempotency_key)
        .bind(blotter_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, idempotency_key: &str) -> Result<(), PstppError> {
        sqlx::query(
            r#"
            UPDATE idempotency_record
            SET status = 'FAILED', completed_at = now()
            WHERE idempotency_key = $1 AND NOT archive_flag
            "#,
        )
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archive_expired(&self, now: DateTime<Utc>) -> Result<u64, PstppError> {
        let result = sqlx::query(
            "UPDATE idempotency_record SET archive_flag = TRUE WHERE NOT archive_flag AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
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
    async fn insert_then_complete_round_trips_against_live_database() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set or unreachable");
            return;
        };
        let store = PostgresIdempotencyRecords::new(pool);
        let key = format!("test_idem_{}", uuid::Uuid::new_v4());
        let record = IdempotencyRecord::new_processing(key.clone(), "T1".into(), "A_B_C".into());
        assert!(store.insert_processing(record).await.unwrap());
        store.mark_completed(&key, "blotter:T1").await.unwrap();
        let found = store.find(&key).await.unwrap().unwrap();
        assert_eq!(found.status, IdempotencyStatus::Completed);
    }
}
