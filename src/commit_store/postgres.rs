//! Single-transaction commit across `partition_state` and
//! `idempotency_record`. Duplicates the per-table SQL the standalone
//! backends use (rather than composing their `PgPool`-bound methods)
//! because both writes must share one `sqlx::Transaction` to satisfy
//! spec.md §5's atomicity requirement; the `partition_state` row lock is
//! taken before `idempotency_record` per the fixed lock ordering in the
//! same section (`swap_blotter` was already locked and released by stage 6's
//! separate upsert before this stage ever runs).

use async_trait::async_trait;
use sqlx::PgPool;

use super::{CommitStore, SequenceAdvance};
use crate::domain::{PartitionState, PositionState};
use crate::error::PstppError;

pub struct PostgresCommitStore {
    pool: PgPool,
}

impl PostgresCommitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommitStore for PostgresCommitStore {
    async fn commit(
        &self,
        partition_key: &str,
        new_seq: Option<u64>,
        sequence_advance: SequenceAdvance,
        next_position: PositionState,
        partition_expected_version: i64,
        idempotency_key: &str,
        blotter_ref: &str,
    ) -> Result<PartitionState, PstppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (String, Option<i64>, i64, chrono::DateTime<chrono::Utc>)>(
            r#"
            SELECT partition_key, last_sequence_number, version, created_at
            FROM partition_state
            WHERE partition_key = $1
            FOR UPDATE
            "#,
        )
        .bind(partition_key)
        .fetch_one(&mut *tx)
        .await?;
        let (partition_key, last_sequence_number, version, created_at) = row;
        if version != partition_expected_version {
            return Err(PstppError::ProcessingError(format!(
                "version mismatch committing {partition_key}: expected {partition_expected_version}, found {version}"
            )));
        }
        let next_seq = match new_seq {
            Some(seq) => {
                if sequence_advance == SequenceAdvance::Consecutive {
                    let expected = last_sequence_number.map(|v| v as u64).unwrap_or(0) + 1;
                    if seq != expected {
                        return Err(PstppError::SequenceGap {
                            partition_key: partition_key.clone(),
                            expected,
                            got: seq,
                        });
                    }
                }
                Some(seq as i64)
            }
            None => last_sequence_number,
        };
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            UPDATE partition_state
            SET state_id = $2, last_sequence_number = $3, version = version + 1, updated_at = $4
            WHERE partition_key = $1
            "#,
        )
        .bind(&partition_key)
        .bind(next_position.id())
        .bind(next_seq)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE idempotency_record
            SET status = 'COMPLETED', blotter_ref = $2, completed_at = $3
            WHERE idempotency_key = $1 AND NOT archive_flag
            "#,
        )
        .bind(idempotency_key)
        .bind(blotter_ref)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PartitionState {
            partition_key,
            state: next_position,
            last_sequence_number: next_seq.map(|v| v as u64),
            version: partition_expected_version + 1,
            created_at,
            updated_at: now,
        })
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
    async fn commit_advances_state_and_completes_idempotency_against_live_database() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set or unreachable");
            return;
        };
        let partition_key = format!("test_commit_{}", uuid::Uuid::new_v4());
        sqlx::query(
            "INSERT INTO partition_state (partition_key, state_id, version, created_at, updated_at) VALUES ($1, 0, 0, now(), now())",
        )
        .bind(&partition_key)
        .execute(&pool)
        .await
        .unwrap();

        let idempotency_key = format!("idem_{}", uuid::Uuid::new_v4());
        sqlx::query(
            "INSERT INTO idempotency_record (idempotency_key, trade_id, partition_key, status, created_at, expires_at) VALUES ($1, $1, $2, 'PROCESSING', now(), now() + interval '1 day')",
        )
        .bind(&idempotency_key)
        .bind(&partition_key)
        .execute(&pool)
        .await
        .unwrap();

        let store = PostgresCommitStore::new(pool);
        let state = store
            .commit(
                &partition_key,
                Some(1),
                SequenceAdvance::Consecutive,
                PositionState::Formed,
                0,
                &idempotency_key,
                "blotter:test",
            )
            .await
            .unwrap();
        assert_eq!(state.last_sequence_number, Some(1));
    }
}
