//! The atomic commit step (§4.5 stage 7): advance `lastSequenceNumber`,
//! write the new `positionState`, and mark the idempotency record
//! COMPLETED, all as one unit — the blotter itself was already persisted by
//! stage 6 ([`crate::pipeline::stages::PersistBlotterStage`]) under its own
//! optimistic-version check. Spec.md §5 calls this pairing out explicitly:
//! "atomicity is at the partition level: these writes belong to a single
//! durable transaction." [`memory::InMemoryCommitStore`] holds the
//! partition-state entry lock for the transition-and-advance step, then
//! completes idempotency separately (sufficient for tests and
//! single-instance use); [`postgres::PostgresCommitStore`] wraps both tables
//! in one
//! `sqlx::Transaction`, taking the `partition_state` row lock before
//! touching `idempotency_record` per the fixed lock ordering in §5.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

pub use memory::InMemoryCommitStore;
pub use postgres::PostgresCommitStore;

use crate::domain::{PartitionState, PositionState};
use crate::error::PstppError;

/// How `new_seq` (when present) is applied to `lastSequenceNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceAdvance {
    /// Enforce `new_seq == last + 1`, the ordinary in-order commit path.
    Consecutive,
    /// Force `lastSequenceNumber` to `new_seq` regardless of the prior
    /// value. Used only for an entry the Sequence Buffer (C3) released past
    /// a gap under `GapPolicy::ReleaseWithWarning` — that policy has
    /// already decided to skip the gap, so the commit must not re-reject it.
    Jump,
}

#[async_trait]
pub trait CommitStore: Send + Sync {
    async fn commit(
        &self,
        partition_key: &str,
        new_seq: Option<u64>,
        sequence_advance: SequenceAdvance,
        next_position: PositionState,
        partition_expected_version: i64,
        idempotency_key: &str,
        blotter_ref: &str,
    ) -> Result<PartitionState, PstppError>;
}
