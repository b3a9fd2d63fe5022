//! Durable, cross-instance `CacheLock` backend. Lock state lives in a
//! `cache_lock` table; a Postgres sequence supplies the monotonically
//! increasing fencing value so two instances racing for the same key can
//! never be handed the same one.
//!
//! ```sql
//! CREATE SEQUENCE IF NOT EXISTS cache_lock_fencing_seq;
//! CREATE TABLE IF NOT EXISTS cache_lock (
//!     key           TEXT PRIMARY KEY,
//!     value         TEXT NOT NULL,
//!     fencing_value BIGINT NOT NULL,
//!     expires_at    TIMESTAMPTZ NOT NULL
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use super::{acquire_with_retry, CacheLock, LockToken};
use crate::error::PstppError;

pub struct PostgresCacheLock {
    pool: PgPool,
}

impl PostgresCacheLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim `key` if it is absent or its lease has expired. A single
    /// `INSERT ... ON CONFLICT DO UPDATE ... WHERE` makes the check-and-set
    /// atomic without a client-side round trip.
    async fn try_acquire_once(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, PstppError> {
        let ttl_secs = ttl.as_secs() as f64;
        let row = sqlx::query_as::<_, (i64, chrono::DateTime<Utc>)>(
            r#"
            INSERT INTO cache_lock (key, value, fencing_value, expires_at)
            VALUES ($1, $1, nextval('cache_lock_fencing_seq'), now() + ($2 || ' seconds')::interval)
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value,
                    fencing_value = nextval('cache_lock_fencing_seq'),
                    expires_at = EXCLUDED.expires_at
                WHERE cache_lock.expires_at <= now()
            RETURNING fencing_value, expires_at
            "#,
        )
        .bind(key)
        .bind(ttl_secs.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(fencing_value, expires_at)| LockToken {
            key: key.to_string(),
            fencing_value: fencing_value as u64,
            expires_at,
        }))
    }
}

#[async_trait]
impl CacheLock for PostgresCacheLock {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PstppError> {
        let ttl_secs = ttl.as_secs() as f64;
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO cache_lock (key, value, fencing_value, expires_at)
            VALUES ($1, $2, nextval('cache_lock_fencing_seq'), now() + ($3 || ' seconds')::interval)
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value,
                    fencing_value = nextval('cache_lock_fencing_seq'),
                    expires_at = EXCLUDED.expires_at
                WHERE cache_lock.expires_at <= now()
            RETURNING fencing_value
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PstppError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM cache_lock WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PstppError> {
        let ttl_secs = ttl.as_secs() as f64;
        sqlx::query(
            r#"
            INSERT INTO cache_lock (key, value, fencing_value, expires_at)
            VALUES ($1, $2, nextval('cache_lock_fencing_seq'), now() + ($3 || ' seconds')::interval)
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value,
                    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn acquire(&self, key: &str, ttl: Duration, deadline: Duration) -> Result<LockToken, PstppError> {
        acquire_with_retry(key, deadline, || self.try_acquire_once(key, ttl)).await
    }

    async fn release(&self, token: &LockToken) -> Result<bool, PstppError> {
        let result = sqlx::query(
            "DELETE FROM cache_lock WHERE key = $1 AND fencing_value = $2",
        )
        .bind(&token.key)
        .bind(token.fencing_value as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<LockToken, PstppError> {
        let ttl_secs = ttl.as_secs() as f64;
        let row = sqlx::query_as::<_, (chrono::DateTime<Utc>,)>(
            r#"
            UPDATE cache_lock
            SET expires_at = now() + ($3 || ' seconds')::interval
            WHERE key = $1 AND fencing_value = $2
            RETURNING expires_at
            "#,
        )
        .bind(&token.key)
        .bind(token.fencing_value as i64)
        .bind(ttl_secs.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((expires_at,)) => Ok(LockToken {
                key: token.key.clone(),
                fencing_value: token.fencing_value,
                expires_at,
            }),
            None => Err(PstppError::LockAcquisitionFailed {
                key: token.key.clone(),
                reason: "fencing value stale or lock not held".into(),
            }),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<Option<u64>, PstppError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT fencing_value FROM cache_lock WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(fencing_value,)| fencing_value as u64))
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
    async fn acquire_release_round_trip_against_live_database() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set or unreachable");
            return;
        };
        let lock = PostgresCacheLock::new(pool);
        let key = format!("test_lock_{}", uuid::Uuid::new_v4());
        let token = lock
            .acquire(&key, Duration::from_secs(5), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(lock.release(&token).await.unwrap());
    }
}
