//! Durable backend — the `swap_blotter` table.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS swap_blotter (
//!     trade_id          TEXT PRIMARY KEY,
//!     partition_key     TEXT NOT NULL,
//!     idempotency_key   TEXT NOT NULL,
//!     source            TEXT NOT NULL,
//!     payload           JSONB NOT NULL,
//!     enrichment_status TEXT NOT NULL,
//!     metadata          JSONB NOT NULL,
//!     version           BIGINT NOT NULL DEFAULT 0,
//!     archive_flag      BOOLEAN NOT NULL DEFAULT FALSE,
//!     created_at        TIMESTAMPTZ NOT NULL,
//!     updated_at        TIMESTAMPTZ NOT NULL
//! );
//! ```

use async_trait::async_trait;
use sqlx::PgPool;

use super::BlotterStore;
use crate::domain::SwapBlotter;
use crate::error::PstppError;

pub struct PostgresBlotterStore {
    pool: PgPool,
}

impl PostgresBlotterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlotterStore for PostgresBlotterStore {
    async fn upsert(&self, blotter: &SwapBlotter, expected_version: i64) -> Result<(), PstppError> {
        let enrichment_status = serde_json::to_value(blotter.enrichment_status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let metadata = serde_json::to_value(&blotter.metadata)?;
        let result = sqlx::query(
            r#"
            INSERT INTO swap_blotter
                (trade_id, partition_key, idempotency_key, source, payload,
                 enrichment_status, metadata, version, archive_flag, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8, $9, $10)
            ON CONFLICT (trade_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                enrichment_status = EXCLUDED.enrichment_status,
                metadata = EXCLUDED.metadata,
                version = swap_blotter.version + 1,
                updated_at = EXCLUDED.updated_at
            WHERE swap_blotter.version = $11
            "#,
        )
        .bind(&blotter.trade_id)
        .bind(&blotter.partition_key)
        .bind(&blotter.idempotency_key)
        .bind(blotter.source.to_string())
        .bind(&blotter.payload)
        .bind(&enrichment_status)
        .bind(&metadata)
        .bind(blotter.archive_flag)
        .bind(blotter.created_at)
        .bind(blotter.updated_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(PstppError::ProcessingError(format!(
                "version mismatch persisting blotter {}: expected {}",
                blotter.trade_id, expected_version
            )));
        }
        Ok(())
    }

    async fn find_by_trade_id(&self, trade_id: &str) -> Result<Option<SwapBlotter>, PstppError> {
        let row = sqlx::query_as::<_, (String, String, String, String, serde_json::Value, String, serde_json::Value, i64, bool, chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>(
            r#"
            SELECT trade_id, partition_key, idempotency_key, source, payload,
                   enrichment_status, metadata, version, archive_flag, created_at, updated_at
            FROM swap_blotter
            WHERE trade_id = $1
            "#,
        )
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(trade_id, partition_key, idempotency_key, source, payload, enrichment_status, metadata, version, archive_flag, created_at, updated_at)| {
            Ok(SwapBlotter {
                trade_id,
                partition_key,
                idempotency_key,
                source: source.parse().map_err(|_| PstppError::ProcessingError(format!("unknown source {source}")))?,
                payload,
                enrichment_status: serde_json::from_value(serde_json::Value::String(enrichment_status))
                    .map_err(|e| PstppError::ProcessingError(e.to_string()))?,
                metadata: serde_json::from_value(metadata).map_err(|e| PstppError::ProcessingError(e.to_string()))?,
                version,
                archive_flag,
                created_at,
                updated_at,
            })
        }).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade_request::{Source, TradeRequest};
    use std::env;

    async fn test_pool() -> Option<PgPool> {
        let url = env::var("DATABASE_URL").ok()?;
        PgPool::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn upsert_then_find_round_trips_against_live_database() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set or unreachable");
            return;
        };
        let store = PostgresBlotterStore::new(pool);
        let trade_id = format!("test_trade_{}", uuid::Uuid::new_v4());
        let req = TradeRequest::new(
            trade_id.clone(),
            "A_B_C".into(),
            None,
            None,
            None,
            Source::Api,
            serde_json::json!({}),
            None,
        )
        .unwrap();
        let blotter = SwapBlotter::from_request(&req);
        store.upsert(&blotter, 0).await.unwrap();
        let found = store.find_by_trade_id(&trade_id).await.unwrap().unwrap();
        assert_eq!(found.version, 1);
    }
}
