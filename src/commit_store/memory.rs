//! Sequential single-process commit — no cross-table transaction, relies on
//! each store's own internal synchronization (DashMap entries) plus the
//! partition worker's single-writer discipline to stay consistent.

use async_trait::async_trait;
use std::sync::Arc;

use super::{CommitStore, SequenceAdvance};
use crate::domain::{PartitionState, PositionState};
use crate::error::PstppError;
use crate::idempotency_store::IdempotencyStore;
use crate::partition_state_store::{assert_next_sequence, PartitionStateStore};

pub struct InMemoryCommitStore {
    partition_states: Arc<dyn PartitionStateStore>,
    idempotency: Arc<IdempotencyStore>,
}

impl InMemoryCommitStore {
    pub fn new(partition_states: Arc<dyn PartitionStateStore>, idempotency: Arc<IdempotencyStore>) -> Self {
        Self {
            partition_states,
            idempotency,
        }
    }
}

#[async_trait]
impl CommitStore for InMemoryCommitStore {
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
        // State transition and sequence advance apply under a single
        // `update` call (one DashMap entry lock held for both checks and
        // both mutations) so a rejected sequence never leaves the state
        // transition applied on its own — the non-atomic two-call version of
        // this let a failed advance strand a half-committed partition.
        let state = self
            .partition_states
            .update(
                partition_key,
                partition_expected_version,
                Box::new(move |s| {
                    if !s.state.can_transition_to(next_position) {
                        return Err(PstppError::InvalidStateTransition {
                            partition_key: s.partition_key.clone(),
                            from: format!("{:?}", s.state),
                            to: format!("{next_position:?}"),
                        });
                    }
                    if let (Some(seq), SequenceAdvance::Consecutive) = (new_seq, sequence_advance) {
                        assert_next_sequence(s, seq)?;
                    }
                    s.transition_to(next_position)?;
                    if let Some(seq) = new_seq {
                        s.advance_sequence(seq);
                    }
                    Ok(())
                }),
            )
            .await?;

        self.idempotency.mark_completed(idempotency_key, blotter_ref).await?;

        Ok(state)
    }
}
