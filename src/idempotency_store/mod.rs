//! Idempotency Store (C2) — two-tier dedupe keyed by `idempotencyKey`.
//!
//! L1 is a distributed cache entry (`idempotency:<key>`) carrying just
//! enough to answer `check` without a durable round trip: status and, for
//! COMPLETED, the blotter reference. L2 is the durable
//! [`crate::domain::IdempotencyRecord`] table, queried on L1 miss and used
//! to warm L1. `markCompleted`/`markFailed` write only to L2, in their own
//! connection/transaction, per spec.md §5's deadlock-avoidance note: a
//! deadlock in the main pipeline commit must never corrupt dedupe state.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub use memory::InMemoryIdempotencyRecords;
pub use postgres::PostgresIdempotencyRecords;

use crate::cache_lock::CacheLock;
use crate::domain::{IdempotencyCheck, IdempotencyRecord, IdempotencyStatus};
use crate::domain::trade_request::TradeRequest;
use crate::error::PstppError;

fn l1_key(idempotency_key: &str) -> String {
    format!("idempotency:{idempotency_key}")
}

/// L1's cached value: a compact encoding of status + blotter ref, just
/// enough to answer `check` without touching L2.
#[derive(Debug, Clone)]
struct L1Entry {
    status: IdempotencyStatus,
    blotter_ref: Option<String>,
}

impl L1Entry {
    fn encode(&self) -> String {
        format!(
            "{}|{}",
            self.status.as_str(),
            self.blotter_ref.clone().unwrap_or_default()
        )
    }

    fn decode(raw: &str) -> Option<Self> {
        let (status, blotter_ref) = raw.split_once('|')?;
        Some(Self {
            status: IdempotencyStatus::from_str_opt(status)?,
            blotter_ref: if blotter_ref.is_empty() {
                None
            } else {
                Some(blotter_ref.to_string())
            },
        })
    }
}

/// The durable (L2) half of the store. Kept as its own small trait — rather
/// than folding into [`CacheLock`] — so `markCompleted`/`markFailed` can run
/// against a connection pool entirely separate from whatever backs the
/// pipeline's main commit, per the isolation requirement in spec.md §4.2.
#[async_trait]
pub trait IdempotencyRecordStore: Send + Sync {
    /// Insert a PROCESSING record. A primary-key violation on
    /// `idempotency_key` (an existing non-archived record) surfaces as
    /// `Ok(false)` — the caller reports DUPLICATE, not an error.
    async fn insert_processing(&self, record: IdempotencyRecord) -> Result<bool, PstppError>;

    async fn find(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>, PstppError>;

    async fn mark_completed(&self, idempotency_key: &str, blotter_ref: &str) -> Result<(), PstppError>;

    async fn mark_failed(&self, idempotency_key: &str) -> Result<(), PstppError>;

    /// Sweep records past `expiresAt`, setting `archive_flag = true`.
    /// Returns the number of records archived.
    async fn archive_expired(&self, now: DateTime<Utc>) -> Result<u64, PstppError>;
}

pub struct IdempotencyStore {
    cache: Arc<dyn CacheLock>,
    records: Arc<dyn IdempotencyRecordStore>,
    l1_ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(cache: Arc<dyn CacheLock>, records: Arc<dyn IdempotencyRecordStore>, l1_ttl: Duration) -> Self {
        Self {
            cache,
            records,
            l1_ttl,
        }
    }

    /// `check(request)` — L1 first, L2 on miss, warming L1 on a non-expired
    /// COMPLETED hit found only in L2.
    pub async fn check(&self, idempotency_key: &str) -> Result<IdempotencyCheck, PstppError> {
        if let Some(raw) = self.cache.get(&l1_key(idempotency_key)).await? {
            if let Some(entry) = L1Entry::decode(&raw) {
                return Ok(match entry.status {
                    IdempotencyStatus::Completed => IdempotencyCheck::HitCompleted {
                        blotter_ref: entry.blotter_ref.unwrap_or_default(),
                    },
                    IdempotencyStatus::Processing => IdempotencyCheck::HitProcessing,
                    IdempotencyStatus::Failed => IdempotencyCheck::Miss,
                });
            }
        }

        let Some(record) = self.records.find(idempotency_key).await? else {
            return Ok(IdempotencyCheck::Miss);
        };
        if record.archive_flag || record.is_expired(Utc::now()) {
            return Ok(IdempotencyCheck::Miss);
        }

        match record.status {
            IdempotencyStatus::Completed => {
                let blotter_ref = record.blotter_ref.clone().unwrap_or_default();
                self.warm_l1(idempotency_key, IdempotencyStatus::Completed, Some(blotter_ref.clone()))
                    .await?;
                Ok(IdempotencyCheck::HitCompleted { blotter_ref })
            }
            IdempotencyStatus::Processing => Ok(IdempotencyCheck::HitProcessing),
            IdempotencyStatus::Failed => Ok(IdempotencyCheck::Miss),
        }
    }

    /// `register(request)` — insert a PROCESSING record in L2, then warm L1.
    /// Returns `Err(PstppError::DuplicateTradeId)` when L2 reports an
    /// existing non-archived record for this key.
    pub async fn register(&self, request: &TradeRequest) -> Result<(), PstppError> {
        let record = IdempotencyRecord::new_processing(
            request.idempotency_key.clone(),
            request.trade_id.clone(),
            request.partition_key.clone(),
        );
        let inserted = self.records.insert_processing(record).await?;
        if !inserted {
            return Err(PstppError::DuplicateTradeId(request.idempotency_key.clone()));
        }
        self.warm_l1(&request.idempotency_key, IdempotencyStatus::Processing, None)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, idempotency_key: &str, blotter_ref: &str) -> Result<(), PstppError> {
        self.records.mark_completed(idempotency_key, blotter_ref).await?;
        self.warm_l1(idempotency_key, IdempotencyStatus::Completed, Some(blotter_ref.to_string()))
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, idempotency_key: &str) -> Result<(), PstppError> {
        self.records.mark_failed(idempotency_key).await?;
        self.warm_l1(idempotency_key, IdempotencyStatus::Failed, None).await?;
        Ok(())
    }

    pub async fn archive_expired(&self, now: DateTime<Utc>) -> Result<u64, PstppError> {
        self.records.archive_expired(now).await
    }

    async fn warm_l1(
        &self,
        idempotency_key: &str,
        status: IdempotencyStatus,
        blotter_ref: Option<String>,
    ) -> Result<(), PstppError> {
        let entry = L1Entry { status, blotter_ref };
        self.cache.set(&l1_key(idempotency_key), &entry.encode(), self.l1_ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_lock::InMemoryCacheLock;
    use crate::domain::trade_request::Source;

    fn sample_request(key: &str) -> TradeRequest {
        TradeRequest::new(
            key.to_string(),
            "A_B_C".into(),
            None,
            None,
            None,
            Source::Api,
            serde_json::json!({}),
            None,
        )
        .unwrap()
    }

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(
            Arc::new(InMemoryCacheLock::new()),
            Arc::new(InMemoryIdempotencyRecords::new()),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn miss_then_register_then_complete_roundtrips() {
        let store = store();
        let req = sample_request("T1");
        assert!(matches!(store.check(&req.idempotency_key).await.unwrap(), IdempotencyCheck::Miss));
        store.register(&req).await.unwrap();
        assert!(matches!(
            store.check(&req.idempotency_key).await.unwrap(),
            IdempotencyCheck::HitProcessing
        ));
        store.mark_completed(&req.idempotency_key, "blotter:T1").await.unwrap();
        match store.check(&req.idempotency_key).await.unwrap() {
            IdempotencyCheck::HitCompleted { blotter_ref } => assert_eq!(blotter_ref, "blotter:T1"),
            other => panic!("expected HitCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn double_register_is_duplicate() {
        let store = store();
        let req = sample_request("T1");
        store.register(&req).await.unwrap();
        let err = store.register(&req).await.unwrap_err();
        assert!(matches!(err, PstppError::DuplicateTradeId(_)));
    }

    #[tokio::test]
    async fn failed_record_is_reported_as_miss_so_it_can_be_retried() {
        let store = store();
        let req = sample_request("T1");
        store.register(&req).await.unwrap();
        store.mark_failed(&req.idempotency_key).await.unwrap();
        assert!(matches!(store.check(&req.idempotency_key).await.unwrap(), IdempotencyCheck::Miss));
    }
}
