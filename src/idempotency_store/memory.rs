//! In-memory L2 backend — test/single-instance deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::IdempotencyRecordStore;
use crate::domain::{IdempotencyRecord, IdempotencyStatus};
use crate::error::PstppError;

#[derive(Default)]
pub struct InMemoryIdempotencyRecords {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyRecordStore for InMemoryIdempotencyRecords {
    async fn insert_processing(&self, record: IdempotencyRecord) -> Result<bool, PstppError> {
        match self.records.entry(record.idempotency_key.clone()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(record);
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                if o.get().archive_flag {
                    o.insert(record);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn find(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>, PstppError> {
        Ok(self.records.get(idempotency_key).map(|r| r.clone()))
    }

    async fn mark_completed(&self, idempotency_key: &str, blotter_ref: &str) -> Result<(), PstppError> {
        if let Some(mut rec) = self.records.get_mut(idempotency_key) {
            rec.status = IdempotencyStatus::Completed;
            rec.blotter_ref = Some(blotter_ref.to_string());
            rec.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, idempotency_key: &str) -> Result<(), PstppError> {
        if let Some(mut rec) = self.records.get_mut(idempotency_key) {
            rec.status = IdempotencyStatus::Failed;
            rec.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn archive_expired(&self, now: DateTime<Utc>) -> Result<u64, PstppError> {
        let mut archived = 0u64;
        for mut entry in self.records.iter_mut() {
            if !entry.archive_flag && entry.is_expired(now) {
                entry.archive_flag = true;
                archived += 1;
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_insert_for_live_key_is_rejected() {
        let store = InMemoryIdempotencyRecords::new();
        let rec = IdempotencyRecord::new_processing("K1".into(), "T1".into(), "A_B_C".into());
        assert!(store.insert_processing(rec.clone()).await.unwrap());
        assert!(!store.insert_processing(rec).await.unwrap());
    }

    #[tokio::test]
    async fn archive_expired_flags_old_records_only() {
        let store = InMemoryIdempotencyRecords::new();
        let mut rec = IdempotencyRecord::new_processing("K1".into(), "T1".into(), "A_B_C".into());
        rec.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.insert_processing(rec).await.unwrap();
        let archived = store.archive_expired(Utc::now()).await.unwrap();
        assert_eq!(archived, 1);
        assert!(store.find("K1").await.unwrap().unwrap().archive_flag);
    }
}
