//! Durable backend — the `partition_state` table.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS partition_state (
//!     partition_key        TEXT PRIMARY KEY,
//!     state_id             SMALLINT NOT NULL,
//!     last_sequence_number BIGINT,
//!     version              BIGINT NOT NULL DEFAULT 0,
//!     created_at           TIMESTAMPTZ NOT NULL,
//!     updated_at           TIMESTAMPTZ NOT NULL,
//!     archive_flag         BOOLEAN NOT NULL DEFAULT FALSE
//! );
//! ```
//!
//! `update`/`advance_sequence` read-then-write within one transaction: the
//! `SELECT ... FOR UPDATE` takes a row lock for the duration, and the
//! trailing `UPDATE ... WHERE version = $n` is the optimistic-concurrency
//! belt matching the application-level `check_version` the in-memory backend
//! enforces directly — here the database is the second witness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{PartitionStateStore, StateMutator, assert_next_sequence};
use crate::domain::{PartitionState, PositionState};
use crate::error::PstppError;

pub struct PostgresPartitionStateStore {
    pool: PgPool,
}

impl PostgresPartitionStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_state(
        row: (String, i16, Option<i64>, i64, DateTime<Utc>, DateTime<Utc>),
    ) -> Result<PartitionState, PstppError> {
        let (partition_key, state_id, last_sequence_number, version, created_at, updated_at) = row;
        let state = PositionState::from_id(state_id)
            .ok_or_else(|| PstppError::ProcessingError(format!("unknown state_id {state_id}")))?;
        Ok(PartitionState {
            partition_key,
            state,
            last_sequence_number: last_sequence_number.map(|v| v as u64),
            version,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl PartitionStateStore for PostgresPartitionStateStore {
    async fn get_or_init(&self, partition_key: &str) -> Result<PartitionState, PstppError> {
        let fresh = PartitionState::new(partition_key.to_string());
        sqlx::query(
            r#"
            INSERT INTO partition_state
                (partition_key, state_id, last_sequence_number, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (partition_key) DO NOTHING
            "#,
        )
        .bind(&fresh.partition_key)
        .bind(fresh.state.id())
        .bind(fresh.last_sequence_number.map(|v| v as i64))
        .bind(fresh.version)
        .bind(fresh.created_at)
        .bind(fresh.updated_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, (String, i16, Option<i64>, i64, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            SELECT partition_key, state_id, last_sequence_number, version, created_at, updated_at
            FROM partition_state
            WHERE partition_key = $1
            "#,
        )
        .bind(partition_key)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_state(row)
    }

    async fn update(
        &self,
        partition_key: &str,
        expected_version: i64,
        mutator: StateMutator,
    ) -> Result<PartitionState, PstppError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, (String, i16, Option<i64>, i64, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            SELECT partition_key, state_id, last_sequence_number, version, created_at, updated_at
            FROM partition_state
            WHERE partition_key = $1
            FOR UPDATE
            "#,
        )
        .bind(partition_key)
        .fetch_one(&mut *tx)
        .await?;
        let mut state = Self::row_to_state(row)?;
        state.check_version(expected_version)?;
        mutator(&mut state)?;
        state.bump_version();

        let result = sqlx::query(
            r#"
            UPDATE partition_state
            SET state_id = $2, last_sequence_number = $3, version = $4, updated_at = $5
            WHERE partition_key = $1 AND version = $6
            "#,
        )
        .bind(partition_key)
        .bind(state.state.id())
        .bind(state.last_sequence_number.map(|v| v as i64))
        .bind(state.version)
        .bind(state.updated_at)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(PstppError::ProcessingError(format!(
                "version mismatch on {partition_key}: concurrent writer won the race"
            )));
        }
        tx.commit().await?;
        Ok(state)
    }

    async fn advance_sequence(&self, partition_key: &str, new_seq: u64) -> Result<PartitionState, PstppError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, (String, i16, Option<i64>, i64, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            SELECT partition_key, state_id, last_sequence_number, version, created_at, updated_at
            FROM partition_state
            WHERE partition_key = $1
            FOR UPDATE
            "#,
        )
        .bind(partition_key)
        .fetch_one(&mut *tx)
        .await?;
        let mut state = Self::row_to_state(row)?;
        assert_next_sequence(&state, new_seq)?;
        let expected_version = state.version;
        state.advance_sequence(new_seq);
        state.bump_version();

        sqlx::query(
            r#"
            UPDATE partition_state
            SET last_sequence_number = $2, version = $3, updated_at = $4
            WHERE partition_key = $1 AND version = $5
            "#,
        )
        .bind(partition_key)
        .bind(state.last_sequence_number.map(|v| v as i64))
        .bind(state.version)
        .bind(state.updated_at)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(state)
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
    async fn get_or_init_then_advance_sequence_round_trips_against_live_database() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set or unreachable");
            return;
        };
        let store = PostgresPartitionStateStore::new(pool);
        let key = format!("test_part_{}", uuid::Uuid::new_v4());
        let state = store.get_or_init(&key).await.unwrap();
        assert_eq!(state.version, 0);
        let advanced = store.advance_sequence(&key, 1).await.unwrap();
        assert_eq!(advanced.last_sequence_number, Some(1));
    }
}
