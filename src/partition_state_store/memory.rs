//! In-memory backend — test/single-instance deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{PartitionStateStore, StateMutator, assert_next_sequence};
use crate::domain::PartitionState;
use crate::error::PstppError;

#[derive(Default)]
pub struct InMemoryPartitionStateStore {
    states: DashMap<String, PartitionState>,
}

impl InMemoryPartitionStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PartitionStateStore for InMemoryPartitionStateStore {
    async fn get_or_init(&self, partition_key: &str) -> Result<PartitionState, PstppError> {
        let entry = self
            .states
            .entry(partition_key.to_string())
            .or_insert_with(|| PartitionState::new(partition_key.to_string()));
        Ok(entry.clone())
    }

    async fn update(
        &self,
        partition_key: &str,
        expected_version: i64,
        mutator: StateMutator,
    ) -> Result<PartitionState, PstppError> {
        let mut entry = self
            .states
            .entry(partition_key.to_string())
            .or_insert_with(|| PartitionState::new(partition_key.to_string()));
        entry.check_version(expected_version)?;
        mutator(&mut entry)?;
        entry.bump_version();
        Ok(entry.clone())
    }

    async fn advance_sequence(&self, partition_key: &str, new_seq: u64) -> Result<PartitionState, PstppError> {
        let mut entry = self
            .states
            .entry(partition_key.to_string())
            .or_insert_with(|| PartitionState::new(partition_key.to_string()));
        assert_next_sequence(&entry, new_seq)?;
        entry.advance_sequence(new_seq);
        entry.bump_version();
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionState;

    #[tokio::test]
    async fn get_or_init_seeds_executed_at_version_zero() {
        let store = InMemoryPartitionStateStore::new();
        let state = store.get_or_init("A_B_C").await.unwrap();
        assert_eq!(state.state, PositionState::Executed);
        assert_eq!(state.version, 0);
    }

    #[tokio::test]
    async fn update_applies_mutator_and_bumps_version_on_matching_expected() {
        let store = InMemoryPartitionStateStore::new();
        store.get_or_init("A_B_C").await.unwrap();
        let updated = store
            .update(
                "A_B_C",
                0,
                Box::new(|s| s.transition_to(PositionState::Formed)),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, PositionState::Formed);
        assert_eq!(updated.version, 1);
    }

    #[tokio::test]
    async fn update_rejects_stale_expected_version() {
        let store = InMemoryPartitionStateStore::new();
        store.get_or_init("A_B_C").await.unwrap();
        store
            .update("A_B_C", 0, Box::new(|s| s.transition_to(PositionState::Formed)))
            .await
            .unwrap();
        let err = store
            .update("A_B_C", 0, Box::new(|s| s.transition_to(PositionState::Settled)))
            .await
            .unwrap_err();
        assert!(matches!(err, PstppError::ProcessingError(_)));
    }

    #[tokio::test]
    async fn advance_sequence_rejects_non_consecutive_jump() {
        let store = InMemoryPartitionStateStore::new();
        store.get_or_init("A_B_C").await.unwrap();
        let err = store.advance_sequence("A_B_C", 5).await.unwrap_err();
        assert!(matches!(err, PstppError::SequenceGap { .. }));
        store.advance_sequence("A_B_C", 1).await.unwrap();
        store.advance_sequence("A_B_C", 2).await.unwrap();
    }
}
