//! Partition State Store (C4) — durable `partitionKey -> PartitionState`
//! mapping. Reads may return a cached copy; writes go through
//! `update(key, expectedVersion, mutator)`'s optimistic-concurrency contract,
//! the same compare-then-mutate shape `transfer/coordinator.rs` used for its
//! own FSM's CAS state transitions, generalized here to an arbitrary mutator
//! closure instead of a fixed `(from, to)` pair.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

pub use memory::InMemoryPartitionStateStore;
pub use postgres::PostgresPartitionStateStore;

use crate::domain::PartitionState;
use crate::error::PstppError;

/// A mutation applied to an in-flight `PartitionState` under the
/// optimistic-concurrency guard. Boxed rather than generic so the trait
/// stays object-safe behind `Arc<dyn PartitionStateStore>`.
pub type StateMutator = Box<dyn FnOnce(&mut PartitionState) -> Result<(), PstppError> + Send>;

#[async_trait]
pub trait PartitionStateStore: Send + Sync {
    /// Fetch the partition's record, seeding a fresh EXECUTED/version-0 row
    /// on first sight of the key.
    async fn get_or_init(&self, partition_key: &str) -> Result<PartitionState, PstppError>;

    /// Apply `mutator` iff the stored `version` equals `expected_version`;
    /// bump `version` by one on success. A version mismatch is surfaced as
    /// `PstppError::ProcessingError` (the caller is expected to re-fetch and
    /// retry, same as any other optimistic-concurrency loser).
    async fn update(
        &self,
        partition_key: &str,
        expected_version: i64,
        mutator: StateMutator,
    ) -> Result<PartitionState, PstppError>;

    /// Advance `lastSequenceNumber`, asserting `new_seq == lastSequenceNumber
    /// + 1` per spec.md §4.4. Runs under the same optimistic-concurrency
    /// discipline as `update`.
    async fn advance_sequence(&self, partition_key: &str, new_seq: u64) -> Result<PartitionState, PstppError>;
}

/// Shared assertion used by both backends' `advance_sequence`.
pub(crate) fn assert_next_sequence(state: &PartitionState, new_seq: u64) -> Result<(), PstppError> {
    let expected = state.last_sequence_number.unwrap_or(0) + 1;
    if new_seq != expected {
        return Err(PstppError::SequenceGap {
            partition_key: state.partition_key.clone(),
            expected,
            got: new_seq,
        });
    }
    Ok(())
}
