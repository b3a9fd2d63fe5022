//! In-memory backend — test/single-instance deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use super::BlotterStore;
use crate::domain::SwapBlotter;
use crate::error::PstppError;

#[derive(Default)]
pub struct InMemoryBlotterStore {
    blotters: DashMap<String, SwapBlotter>,
}

impl InMemoryBlotterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlotterStore for InMemoryBlotterStore {
    async fn upsert(&self, blotter: &SwapBlotter, expected_version: i64) -> Result<(), PstppError> {
        if let Some(existing) = self.blotters.get(&blotter.trade_id) {
            if existing.version != expected_version {
                return Err(PstppError::ProcessingError(format!(
                    "version mismatch persisting blotter {}: expected {}, found {}",
                    blotter.trade_id, expected_version, existing.version
                )));
            }
        } else if expected_version != 0 {
            return Err(PstppError::ProcessingError(format!(
                "version mismatch persisting blotter {}: no existing row but expected {}",
                blotter.trade_id, expected_version
            )));
        }
        let mut next = blotter.clone();
        next.version = expected_version + 1;
        self.blotters.insert(next.trade_id.clone(), next);
        Ok(())
    }

    async fn find_by_trade_id(&self, trade_id: &str) -> Result<Option<SwapBlotter>, PstppError> {
        Ok(self.blotters.get(trade_id).map(|b| b.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade_request::Source;
    use crate::domain::trade_request::TradeRequest;

    fn sample() -> SwapBlotter {
        let req = TradeRequest::new(
            "T1".into(),
            "A_B_C".into(),
            None,
            None,
            None,
            Source::Api,
            serde_json::json!({}),
            None,
        )
        .unwrap();
        SwapBlotter::from_request(&req)
    }

    #[tokio::test]
    async fn first_upsert_requires_expected_version_zero() {
        let store = InMemoryBlotterStore::new();
        store.upsert(&sample(), 0).await.unwrap();
        let found = store.find_by_trade_id("T1").await.unwrap().unwrap();
        assert_eq!(found.version, 1);
    }

    #[tokio::test]
    async fn stale_expected_version_is_rejected() {
        let store = InMemoryBlotterStore::new();
        store.upsert(&sample(), 0).await.unwrap();
        let err = store.upsert(&sample(), 0).await.unwrap_err();
        assert!(matches!(err, PstppError::ProcessingError(_)));
        store.upsert(&sample(), 1).await.unwrap();
    }
}
